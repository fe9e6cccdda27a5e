//! Raw calendar resources, as handed over by the resource store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::ResourceType;
use crate::date_range::DateRange;

pub type ResourceId = i64;
pub type CollectionId = i64;

/// One raw calendar entity (VEVENT, VTODO or VJOURNAL) stored by the resource layer.
///
/// The payload is opaque to this crate: it is only ever handed to a
/// [`RecurrenceExpander`](crate::traits::RecurrenceExpander).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    resource_id: ResourceId,
    collection_id: CollectionId,
    /// `None` for resources that are not calendar components (e.g. address cards)
    kind: Option<ResourceType>,
    payload: String,
    earliest_start: Option<DateTime<Utc>>,
    latest_end: Option<DateTime<Utc>>,
}

impl Resource {
    pub fn new(resource_id: ResourceId, collection_id: CollectionId, kind: Option<ResourceType>, payload: String) -> Self {
        Self {
            resource_id, collection_id, kind, payload,
            earliest_start: None,
            latest_end: None,
        }
    }

    /// Set the span hints the store computed for this resource
    pub fn with_span(mut self, earliest_start: Option<DateTime<Utc>>, latest_end: Option<DateTime<Utc>>) -> Self {
        self.earliest_start = earliest_start;
        self.latest_end = latest_end;
        self
    }

    pub fn resource_id(&self) -> ResourceId     { self.resource_id }
    pub fn collection_id(&self) -> CollectionId { self.collection_id }
    pub fn kind(&self) -> Option<ResourceType>  { self.kind }
    pub fn payload(&self) -> &str               { &self.payload }
    pub fn earliest_start(&self) -> Option<DateTime<Utc>> { self.earliest_start }
    pub fn latest_end(&self) -> Option<DateTime<Utc>>     { self.latest_end }

    /// Whether the span hints allow this resource to have an occurrence in `range`.
    /// Missing hints mean unbounded.
    pub fn may_intersect(&self, range: &DateRange) -> bool {
        let starts_in_time = self.earliest_start.map_or(true, |start| start < range.end);
        let ends_in_time = self.latest_end.map_or(true, |end| end > range.start);
        starts_in_time && ends_in_time
    }
}


/// What happened to a resource
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceAction {
    Insert,
    Update,
    Delete,
    /// A local edit waiting to be synced to the server
    Pending,
}

/// One entry of a [`ResourceChangedEvent`]
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceChange {
    pub action: ResourceAction,
    pub resource_id: ResourceId,
    pub collection_id: CollectionId,
    /// The new state of the resource. Always `None` for deletions
    pub resource: Option<Resource>,
}

impl ResourceChange {
    pub fn inserted(resource: Resource) -> Self {
        Self::with_resource(ResourceAction::Insert, resource)
    }

    pub fn updated(resource: Resource) -> Self {
        Self::with_resource(ResourceAction::Update, resource)
    }

    pub fn pending(resource: Resource) -> Self {
        Self::with_resource(ResourceAction::Pending, resource)
    }

    pub fn deleted(resource_id: ResourceId, collection_id: CollectionId) -> Self {
        Self { action: ResourceAction::Delete, resource_id, collection_id, resource: None }
    }

    fn with_resource(action: ResourceAction, resource: Resource) -> Self {
        Self {
            action,
            resource_id: resource.resource_id(),
            collection_id: resource.collection_id(),
            resource: Some(resource),
        }
    }
}

/// A batch of changes delivered by the resource store in one notification
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceChangedEvent {
    changes: Vec<ResourceChange>,
}

impl ResourceChangedEvent {
    pub fn new(changes: Vec<ResourceChange>) -> Self {
        Self { changes }
    }

    pub fn changes(&self) -> &[ResourceChange] {
        &self.changes
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}
