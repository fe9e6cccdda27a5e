//! This crate keeps the occurrences and the alarms of a calendar ready to use.
//!
//! Expanding recurrences is slow, and views need their events quickly.
//! The [`CacheManager`](cache::CacheManager) materializes the occurrences of every resource over a sliding window of time,
//! and keeps them in sync when resources change.
//!
//! The [`AlarmQueueManager`](alarm::AlarmQueueManager) keeps the alarm triggers of the next weeks,
//! handles snoozes and dismissals, and registers a single OS wakeup for the next one.
//!
//! Both managers own their table on a dedicated worker thread, and persist it along with a meta row
//! that tells whether the last run was closed cleanly. Everything they need from the outside world
//! (the resource store, recurrence expansion, the OS alarm clock) comes through the [`traits`].

pub mod traits;

pub mod alarm;
pub mod cache;
pub mod change;
pub mod config;
pub mod date_range;
pub mod error;
pub mod meta;
pub mod resource;
pub mod table;
mod worker;

pub use config::Settings;
pub use date_range::DateRange;
pub use error::{Error, Result};
pub use worker::Responder;

pub mod utils;
