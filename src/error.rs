//! Error types of the cache and alarm managers

use std::time::Duration;

use thiserror::Error;

use crate::alarm::AlarmState;
use crate::table::RowId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0} is closed, requests are no longer accepted")]
    Closed(&'static str),

    #[error("{0} worker thread is gone")]
    WorkerGone(&'static str),

    #[error("waited too long ({}s) for a {request} response", .waited.as_secs())]
    Timeout { request: &'static str, waited: Duration },

    #[error("unable to acquire the meta lock within {}ms", .0.as_millis())]
    MetaLock(Duration),

    #[error("no tokio runtime available to fetch resources")]
    NoRuntime,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Resource store error: {0}")]
    Store(String),

    #[error("Unable to expand resource {resource_id}: {message}")]
    Expansion { resource_id: i64, message: String },

    #[error("Invalid row: {0}")]
    InvalidRow(String),

    #[error("No alarm with row id {0}")]
    AlarmNotFound(RowId),

    #[error("Alarm cannot go from {from:?} to {to:?}")]
    InvalidTransition { from: AlarmState, to: AlarmState },

    #[error("{0} started a transaction without ending it")]
    TransactionLeftOpen(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
