//! Materialized occurrences

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use bitflags::bitflags;

use crate::date_range::DateRange;
use crate::resource::{CollectionId, ResourceId};
use crate::table::{RowId, TableRow};

/// The kind of calendar component an occurrence comes from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    /// VEVENT
    Event,
    /// VTODO
    Task,
    /// VJOURNAL
    Note,
}

impl ResourceType {
    pub fn component_name(&self) -> &'static str {
        match self {
            ResourceType::Event => "VEVENT",
            ResourceType::Task => "VTODO",
            ResourceType::Note => "VJOURNAL",
        }
    }
}

bitflags! {
    #[derive(Serialize, Deserialize)]
    pub struct CacheFlags: u8 {
        const HAS_ALARM = 1;
        const RECURS = 1 << 1;
        const ALL_DAY = 1 << 2;
        /// A local change that has not reached the server yet
        const PENDING = 1 << 3;
        /// The start is a wall-clock time in the viewer's timezone
        const START_FLOATING = 1 << 4;
        /// The end is a wall-clock time in the viewer's timezone
        const END_FLOATING = 1 << 5;
        const COMPLETED_FLOATING = 1 << 6;
    }
}

impl Default for CacheFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// One materialized occurrence of a (possibly recurring) resource.
///
/// Floating instants are stored as their wall-clock reading taken as if it were UTC.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheRow {
    id: Option<RowId>,
    resource_id: ResourceId,
    collection_id: CollectionId,
    recurrence_id: String,
    resource_type: ResourceType,
    summary: String,
    location: String,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    completed: Option<DateTime<Utc>>,
    flags: CacheFlags,
}

impl CacheRow {
    pub fn new(resource_id: ResourceId, collection_id: CollectionId, recurrence_id: String,
               resource_type: ResourceType, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self
    {
        Self {
            id: None,
            resource_id, collection_id, recurrence_id, resource_type,
            summary: String::new(),
            location: String::new(),
            start, end,
            completed: None,
            flags: CacheFlags::empty(),
        }
    }

    pub fn with_summary(mut self, summary: &str) -> Self {
        self.summary = summary.to_string();
        self
    }

    pub fn with_location(mut self, location: &str) -> Self {
        self.location = location.to_string();
        self
    }

    pub fn with_completed(mut self, completed: Option<DateTime<Utc>>) -> Self {
        self.completed = completed;
        self
    }

    pub fn with_flags(mut self, flags: CacheFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn id(&self) -> Option<RowId>                 { self.id }
    pub fn resource_id(&self) -> ResourceId           { self.resource_id }
    pub fn collection_id(&self) -> CollectionId       { self.collection_id }
    pub fn recurrence_id(&self) -> &str               { &self.recurrence_id }
    pub fn resource_type(&self) -> ResourceType       { self.resource_type }
    pub fn summary(&self) -> &str                     { &self.summary }
    pub fn location(&self) -> &str                    { &self.location }
    pub fn start(&self) -> Option<DateTime<Utc>>      { self.start }
    pub fn end(&self) -> Option<DateTime<Utc>>        { self.end }
    pub fn completed(&self) -> Option<DateTime<Utc>>  { self.completed }
    pub fn flags(&self) -> CacheFlags                 { self.flags }

    pub fn has_alarm(&self) -> bool         { self.flags.contains(CacheFlags::HAS_ALARM) }
    pub fn recurs(&self) -> bool            { self.flags.contains(CacheFlags::RECURS) }
    pub fn is_all_day(&self) -> bool        { self.flags.contains(CacheFlags::ALL_DAY) }
    pub fn is_pending(&self) -> bool        { self.flags.contains(CacheFlags::PENDING) }
    pub fn start_is_floating(&self) -> bool { self.flags.contains(CacheFlags::START_FLOATING) }
    pub fn end_is_floating(&self) -> bool   { self.flags.contains(CacheFlags::END_FLOATING) }

    /// The absolute start, given the viewer's UTC offset
    pub fn effective_start(&self, offset: Duration) -> Option<DateTime<Utc>> {
        self.start.map(|s| if self.start_is_floating() { s - offset } else { s })
    }

    /// The absolute end, given the viewer's UTC offset
    pub fn effective_end(&self, offset: Duration) -> Option<DateTime<Utc>> {
        self.end.map(|e| if self.end_is_floating() { e - offset } else { e })
    }

    /// Whether this occurrence intersects `range`. A missing endpoint is unbounded
    pub fn intersects(&self, range: &DateRange, offset: Duration) -> bool {
        let ends_after_start = self.effective_end(offset).map_or(true, |end| end > range.start);
        let starts_before_end = self.effective_start(offset).map_or(true, |start| start < range.end);
        ends_after_start && starts_before_end
    }

    /// Whether this row has a start and an end (dateless tasks have neither)
    pub fn is_dated(&self) -> bool {
        self.start.is_some() && self.end.is_some()
    }
}

impl TableRow for CacheRow {
    fn row_id(&self) -> Option<RowId> {
        self.id
    }

    fn set_row_id(&mut self, id: RowId) {
        self.id = Some(id);
    }

    fn resource_id(&self) -> ResourceId {
        self.resource_id
    }
}
