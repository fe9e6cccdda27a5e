//! The alarm queue
//!
//! Alarm triggers of the next weeks are kept in a table, and exactly one OS wakeup
//! is registered, for the trigger that fires first.

mod manager;
mod request;
mod row;
mod table;

pub use manager::AlarmQueueManager;
pub use request::AlarmRequest;
pub use row::{AlarmRow, AlarmState};
