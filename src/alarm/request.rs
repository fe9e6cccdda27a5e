use crate::alarm::row::{AlarmRow, AlarmState};
use crate::error::Result;
use crate::resource::{Resource, ResourceChangedEvent};
use crate::table::RowId;
use crate::worker::Responder;

/// Requests processed by the alarm worker
pub enum AlarmRequest {
    /// Snooze or dismiss an alarm, answering with its new state
    UpdateState {
        row_id: RowId,
        state: AlarmState,
        respond: Option<Responder<Result<AlarmRow>>>,
    },
    /// The active alarm that fires first
    NextAlarm(Responder<Option<AlarmRow>>),
    /// The active alarm that should have fired first. When there is none, the wakeup is rescheduled
    NextOverdue(Responder<Option<AlarmRow>>),
    /// Every row, ordered by time to fire
    Queue(Responder<Vec<AlarmRow>>),
    /// Log every row, ordered by time to fire
    LogQueue,
    /// Drop every row, dismissed ones included, and rebuild from the resource store
    RebuildQueue,
    /// Resources changed in the store
    ResourceChanged(ResourceChangedEvent),

    /// Replace the active rows with the alarms of `resources`
    #[doc(hidden)]
    Rebuild { resources: Vec<Resource> },
}

impl AlarmRequest {
    pub fn name(&self) -> &'static str {
        match self {
            AlarmRequest::UpdateState { .. } => "UpdateState",
            AlarmRequest::NextAlarm(_) => "NextAlarm",
            AlarmRequest::NextOverdue(_) => "NextOverdue",
            AlarmRequest::Queue(_) => "Queue",
            AlarmRequest::LogQueue => "LogQueue",
            AlarmRequest::RebuildQueue => "RebuildQueue",
            AlarmRequest::ResourceChanged(_) => "ResourceChanged",
            AlarmRequest::Rebuild { .. } => "Rebuild",
        }
    }
}
