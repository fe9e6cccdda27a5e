//! Row-level change notifications emitted by the tables

use std::sync::{Arc, Mutex, PoisonError};

use crate::resource::ResourceId;
use crate::table::RowId;

/// What happened to a table row
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowAction {
    Insert,
    Update,
    Delete,
}

/// One row-level change
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataChangeEvent {
    pub action: RowAction,
    pub row_id: RowId,
    pub resource_id: ResourceId,
}

/// All changes of one committed cache mutation, coalesced
#[derive(Clone, Debug, PartialEq)]
pub struct CacheChangedEvent {
    changes: Vec<DataChangeEvent>,
    window_only: bool,
}

impl CacheChangedEvent {
    pub fn new(changes: Vec<DataChangeEvent>, window_only: bool) -> Self {
        Self { changes, window_only }
    }

    pub fn changes(&self) -> &[DataChangeEvent] {
        &self.changes
    }

    /// True when the change comes from window maintenance (range fetches,
    /// eviction, clearing) rather than from an edited resource
    pub fn window_only(&self) -> bool {
        self.window_only
    }

    pub fn touches_resource(&self, resource_id: ResourceId) -> bool {
        self.changes.iter().any(|c| c.resource_id == resource_id)
    }
}

/// All changes of one committed alarm table mutation
#[derive(Clone, Debug, PartialEq)]
pub struct AlarmChangedEvent {
    changes: Vec<DataChangeEvent>,
}

impl AlarmChangedEvent {
    pub fn new(changes: Vec<DataChangeEvent>) -> Self {
        Self { changes }
    }

    pub fn changes(&self) -> &[DataChangeEvent] {
        &self.changes
    }
}


/// The listeners of a manager, shared between its handle and its worker
pub(crate) struct ListenerSet<L: ?Sized> {
    listeners: Arc<Mutex<Vec<Arc<L>>>>,
}

impl<L: ?Sized> Clone for ListenerSet<L> {
    fn clone(&self) -> Self {
        Self { listeners: Arc::clone(&self.listeners) }
    }
}

impl<L: ?Sized> ListenerSet<L> {
    pub fn new() -> Self {
        Self { listeners: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn add(&self, listener: Arc<L>) {
        self.lock().push(listener);
    }

    /// Returns false if `listener` was not registered
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|l| !same_listener(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// The listeners at this instant, so that none is called with the lock held
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<L>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn same_listener<L: ?Sized>(a: &Arc<L>, b: &Arc<L>) -> bool {
    Arc::as_ptr(a) as *const u8 == Arc::as_ptr(b) as *const u8
}
