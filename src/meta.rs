//! Persisted per-manager meta state, used to detect unclean shutdowns
//!
//! Each manager owns a single-row meta table `{_id, closed, dtstart, dtend, count}`.
//! `closed` is written as dirty when a manager starts and as clean when it closes:
//! finding it dirty at startup means the previous run crashed and that the table cannot be trusted.

use std::path::PathBuf;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::date_range::DateRange;
use crate::error::{Error, Result};

pub const CLOSED_STATE_DIRTY: u8 = 0;
pub const CLOSED_STATE_CLEAN: u8 = 1;

/// The single meta row
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetaState {
    #[serde(rename = "_id")]
    pub id: i64,
    pub closed: u8,
    /// Epoch milliseconds, -1 when there is no window
    pub dtstart: i64,
    pub dtend: i64,
    pub count: i64,
}

impl MetaState {
    pub fn new(clean: bool, window: Option<DateRange>, count: usize) -> Self {
        let (dtstart, dtend) = match window {
            Some(w) => (w.start.timestamp_millis(), w.end.timestamp_millis()),
            None => (-1, -1),
        };
        Self {
            id: 1,
            closed: if clean { CLOSED_STATE_CLEAN } else { CLOSED_STATE_DIRTY },
            dtstart, dtend,
            count: count as i64,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.closed == CLOSED_STATE_CLEAN
    }

    pub fn window(&self) -> Option<DateRange> {
        if self.dtstart < 0 || self.dtend < 0 {
            return None;
        }
        DateRange::from_millis(self.dtstart, self.dtend).filter(|range| !range.is_empty())
    }
}


/// A binary lock with a bounded wait.
///
/// Failing to get it within the timeout is a hard failure: carrying on would risk corrupting the persisted state.
#[derive(Debug, Default)]
pub struct MetaLock {
    locked: Mutex<bool>,
    released: Condvar,
}

impl MetaLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, timeout: Duration) -> Result<MetaLockGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut locked = self.locked.lock().unwrap_or_else(PoisonError::into_inner);
        while *locked {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(r) if r > Duration::from_millis(0) => r,
                _ => {
                    log::error!("Unable to acquire the meta lock within {:?}", timeout);
                    return Err(Error::MetaLock(timeout));
                }
            };
            let (guard, _) = self.released
                .wait_timeout(locked, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            locked = guard;
        }
        *locked = true;
        Ok(MetaLockGuard { lock: self })
    }

    fn release(&self) {
        let mut locked = self.locked.lock().unwrap_or_else(PoisonError::into_inner);
        if !*locked {
            log::error!("Meta lock released already!");
        }
        *locked = false;
        self.released.notify_one();
    }
}

/// Releases the [`MetaLock`] when dropped
#[derive(Debug)]
pub struct MetaLockGuard<'a> {
    lock: &'a MetaLock,
}

impl Drop for MetaLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}


/// Where a manager keeps its meta row: a JSON file, or memory only
#[derive(Debug)]
pub struct MetaStore {
    name: &'static str,
    backing_file: Option<PathBuf>,
    in_memory: Mutex<Option<MetaState>>,
    lock: MetaLock,
    lock_timeout: Duration,
}

impl MetaStore {
    pub fn new(name: &'static str, backing_file: Option<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            name, backing_file,
            in_memory: Mutex::new(None),
            lock: MetaLock::new(),
            lock_timeout,
        }
    }

    /// A memory-only store that starts with `initial` as its row
    pub fn in_memory(name: &'static str, initial: Option<MetaState>, lock_timeout: Duration) -> Self {
        let store = Self::new(name, None, lock_timeout);
        *store.in_memory.lock().unwrap_or_else(PoisonError::into_inner) = initial;
        store
    }

    /// Read the meta row. A row that cannot be read counts as missing
    pub fn load(&self) -> Result<Option<MetaState>> {
        let _guard = self.lock.acquire(self.lock_timeout)?;
        let state = match &self.backing_file {
            None => self.in_memory.lock().unwrap_or_else(PoisonError::into_inner).clone(),
            Some(path) if !path.exists() => None,
            Some(path) => {
                let read = std::fs::File::open(path)
                    .map_err(Error::from)
                    .and_then(|file| serde_json::from_reader(file).map_err(Error::from));
                match read {
                    Ok(state) => Some(state),
                    Err(err) => {
                        log::warn!("Unable to read the {} meta row from {:?}: {}", self.name, path, err);
                        None
                    }
                }
            }
        };
        Ok(state)
    }

    /// Replace the meta row
    pub fn store(&self, state: &MetaState) -> Result<()> {
        let _guard = self.lock.acquire(self.lock_timeout)?;
        match &self.backing_file {
            None => {
                *self.in_memory.lock().unwrap_or_else(PoisonError::into_inner) = Some(state.clone());
            },
            Some(path) => {
                let file = std::fs::File::create(path)?;
                serde_json::to_writer(file, state)?;
            },
        }
        log::debug!("Stored {} meta row: {:?}", self.name, state);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn meta_lock_times_out_while_held() {
        let lock = MetaLock::new();
        let guard = lock.acquire(Duration::from_millis(10)).unwrap();
        match lock.acquire(Duration::from_millis(30)) {
            Err(Error::MetaLock(_)) => {},
            other => panic!("expected a meta lock timeout, got {:?}", other.map(|_| ())),
        }
        drop(guard);
        assert!(lock.acquire(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn meta_lock_wakes_up_waiters() {
        let lock = Arc::new(MetaLock::new());
        let guard = lock.acquire(Duration::from_millis(10)).unwrap();

        let waiter = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || lock.acquire(Duration::from_secs(5)).map(|_| ()).is_ok())
        };
        std::thread::sleep(Duration::from_millis(50));
        drop(guard);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn meta_row_uses_the_persisted_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        let store = MetaStore::new("test", Some(path.clone()), Duration::from_secs(1));
        assert_eq!(store.load().unwrap(), None);

        let window = DateRange::from_millis(1_000, 2_000).unwrap();
        store.store(&MetaState::new(false, Some(window), 3)).unwrap();

        let raw: serde_json::Value = serde_json::from_reader(std::fs::File::open(&path).unwrap()).unwrap();
        assert_eq!(raw["_id"], 1);
        assert_eq!(raw["closed"], 0);
        assert_eq!(raw["dtstart"], 1_000);
        assert_eq!(raw["dtend"], 2_000);
        assert_eq!(raw["count"], 3);

        let loaded = store.load().unwrap().unwrap();
        assert!(!loaded.is_clean());
        assert_eq!(loaded.window(), Some(window));
    }

    #[test]
    fn no_window_is_stored_as_minus_one() {
        let state = MetaState::new(true, None, 0);
        assert_eq!((state.dtstart, state.dtend), (-1, -1));
        assert_eq!(state.window(), None);
        assert!(state.is_clean());
    }
}
