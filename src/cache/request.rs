//! Requests processed by the cache worker

use crate::cache::row::{CacheRow, ResourceType};
use crate::cache::window::CacheWindow;
use crate::date_range::DateRange;
use crate::resource::ResourceChangedEvent;
use crate::worker::Responder;

pub enum CacheRequest {
    /// Rows intersecting `range`, ordered by start.
    /// Empty if the window does not cover `range` yet, in which case a fetch is started:
    /// ask again once a [`CacheChangedEvent`](crate::change::CacheChangedEvent) arrives.
    /// Without a responder, this only makes sure the window grows to `range`.
    ObjectsInRange {
        range: DateRange,
        filter: Option<ResourceType>,
        respond: Option<Responder<Vec<CacheRow>>>,
    },
    /// The first `count` rows starting within the next days, ordered by start
    NextObjects {
        count: usize,
        filter: Option<ResourceType>,
        respond: Responder<Vec<CacheRow>>,
    },
    /// Whether the window covers `range`. If it does not, a fetch is started
    CheckWindow {
        range: DateRange,
        respond: Option<Responder<bool>>,
    },
    /// A snapshot of the window
    CurrentWindow(Responder<CacheWindow>),
    /// Evict `range` from the window, and the rows that only lived there
    ReduceRange(DateRange),
    /// Drop every row and fetch the default window again
    ClearCache,
    /// Resources changed in the store
    ResourceChanged(ResourceChangedEvent),

    /// The expanded occurrences of a fetch, to replace whatever the table holds in `range`
    #[doc(hidden)]
    AddRangeResult { range: DateRange, rows: Vec<CacheRow> },
    #[doc(hidden)]
    FetchFailed { range: DateRange, error: String },
}

impl CacheRequest {
    pub fn name(&self) -> &'static str {
        match self {
            CacheRequest::ObjectsInRange { .. } => "ObjectsInRange",
            CacheRequest::NextObjects { .. } => "NextObjects",
            CacheRequest::CheckWindow { .. } => "CheckWindow",
            CacheRequest::CurrentWindow(_) => "CurrentWindow",
            CacheRequest::ReduceRange(_) => "ReduceRange",
            CacheRequest::ClearCache => "ClearCache",
            CacheRequest::ResourceChanged(_) => "ResourceChanged",
            CacheRequest::AddRangeResult { .. } => "AddRangeResult",
            CacheRequest::FetchFailed { .. } => "FetchFailed",
        }
    }
}
