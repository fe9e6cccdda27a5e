//! Seams to the collaborators of the cache and alarm managers

use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Local, Offset, TimeZone, Utc};

use crate::alarm::AlarmRow;
use crate::cache::CacheRow;
use crate::change::{AlarmChangedEvent, CacheChangedEvent};
use crate::date_range::DateRange;
use crate::resource::{Resource, ResourceChangedEvent};

pub type CollaboratorError = Box<dyn Error + Send + Sync>;

/// The durable store of raw calendar resources
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Returns every resource that may have an occurrence in `range`
    async fn get_resources_in_range(&self, range: &DateRange) -> Result<Vec<Resource>, CollaboratorError>;

    /// Returns every resource that carries at least one alarm component
    async fn get_resources_with_alarms(&self) -> Result<Vec<Resource>, CollaboratorError>;

    /// Subscribe to change notifications
    fn add_listener(&self, listener: Arc<dyn ResourceChangedListener>);
    /// Unsubscribe a listener previously passed to `add_listener`
    fn remove_listener(&self, listener: &Arc<dyn ResourceChangedListener>);
}

pub trait ResourceChangedListener: Send + Sync {
    fn resource_changed(&self, event: ResourceChangedEvent);
}

/// Recurrence expansion, treated as a pure function of a resource and a range
pub trait RecurrenceExpander: Send + Sync {
    /// The occurrences of `resource` that intersect `range`
    fn instances_between(&self, resource: &Resource, range: &DateRange) -> Result<Vec<CacheRow>, CollaboratorError>;

    /// The alarm triggers of `resource` whose nominal instant lies in `range`
    fn alarms_between(&self, resource: &Resource, range: &DateRange) -> Result<Vec<AlarmRow>, CollaboratorError>;
}

/// The OS-level exact alarm clock
pub trait WakeupScheduler: Send + Sync {
    /// Register the single wakeup, replacing any previous one
    fn schedule(&self, at: DateTime<Utc>);
    /// Remove the registered wakeup, if any
    fn cancel(&self);
}

/// Source of "now" and of the local timezone offset used for floating times
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// The offset of the viewer's timezone at `at`
    fn local_offset(&self, at: DateTime<Utc>) -> FixedOffset {
        Local.offset_from_utc_datetime(&at.naive_utc()).fix()
    }
}

/// The real wall clock, in the system timezone
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub trait CacheChangedListener: Send + Sync {
    fn cache_changed(&self, event: &CacheChangedEvent);
}

pub trait AlarmChangedListener: Send + Sync {
    fn alarm_changed(&self, event: &AlarmChangedEvent);
}

/// Home-screen widgets that display cached occurrences
pub trait WidgetRefresher: Send + Sync {
    fn refresh_widgets(&self);
}
