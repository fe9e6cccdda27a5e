//! The occurrence cache
//!
//! Occurrences of every resource are materialized over a sliding window of time,
//! so that views can query them by date range without expanding recurrences.

mod manager;
mod request;
mod row;
mod table;
mod window;

pub use manager::{CacheManager, CacheManagerBuilder};
pub use request::CacheRequest;
pub use row::{CacheFlags, CacheRow, ResourceType};
pub use window::CacheWindow;
