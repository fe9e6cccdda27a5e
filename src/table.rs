//! A transactional table of rows, persisted as a JSON file
//!
//! Tables are owned by exactly one worker thread, so they do no locking of their own.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::change::{DataChangeEvent, RowAction};
use crate::error::Result;
use crate::resource::ResourceId;

pub type RowId = i64;

/// Something that can be stored in a [`Table`]
pub trait TableRow: Clone + Serialize + DeserializeOwned {
    /// `None` until the row has been inserted
    fn row_id(&self) -> Option<RowId>;
    fn set_row_id(&mut self, id: RowId);
    fn resource_id(&self) -> ResourceId;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "R: DeserializeOwned"))]
struct TableData<R> {
    next_id: RowId,
    rows: BTreeMap<RowId, R>,
}

impl<R> Default for TableData<R> {
    fn default() -> Self {
        Self { next_id: 1, rows: BTreeMap::new() }
    }
}

/// State saved when a transaction begins, restored if it does not succeed
#[derive(Debug)]
struct Transaction<R> {
    snapshot: TableData<R>,
    changes_before: usize,
    successful: bool,
}

#[derive(Debug)]
pub struct Table<R> {
    name: &'static str,
    backing_file: Option<PathBuf>,
    data: TableData<R>,
    transaction: Option<Transaction<R>>,
    changes: Vec<DataChangeEvent>,
}

impl<R: TableRow> Table<R> {
    /// An empty table, saved to `backing_file` (if any) by [`Self::save_to_file`]
    pub fn new(name: &'static str, backing_file: Option<PathBuf>) -> Self {
        Self {
            name, backing_file,
            data: TableData::default(),
            transaction: None,
            changes: Vec::new(),
        }
    }

    /// Initialize a table from the content of its backing file if it exists.
    /// A file that cannot be read yields an empty table, which the dirty flag will get rebuilt anyway.
    pub fn load_or_new(name: &'static str, backing_file: Option<PathBuf>) -> Self {
        let mut table = Self::new(name, backing_file);
        if let Some(path) = table.backing_file.clone() {
            if path.exists() {
                match Self::read_file(&path) {
                    Ok(data) => table.data = data,
                    Err(err) => log::warn!("Unable to load table {} from {:?}: {}", name, path, err),
                }
            }
        }
        table
    }

    fn read_file(path: &Path) -> Result<TableData<R>> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    /// Store the current rows to the backing file
    pub fn save_to_file(&self) -> Result<()> {
        let path = match &self.backing_file {
            None => return Ok(()),
            Some(p) => p,
        };
        let file = std::fs::File::create(path)?;
        serde_json::to_writer(std::io::BufWriter::new(file), &self.data)?;
        log::debug!("Saved {} rows of {} to {:?}", self.data.rows.len(), self.name, path);
        Ok(())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.data.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.rows.is_empty()
    }


    pub fn begin_tx(&mut self) {
        if self.transaction.is_some() {
            log::error!("Nested transaction on table {}, ignoring it", self.name);
            return;
        }
        self.transaction = Some(Transaction {
            snapshot: TableData { next_id: self.data.next_id, rows: self.data.rows.clone() },
            changes_before: self.changes.len(),
            successful: false,
        });
    }

    pub fn set_tx_successful(&mut self) {
        if let Some(tx) = self.transaction.as_mut() {
            tx.successful = true;
        }
    }

    /// Ends the current transaction: keeps its writes if it was marked successful, undoes them otherwise.
    /// Returns whether the writes were kept
    pub fn end_tx(&mut self) -> bool {
        match self.transaction.take() {
            None => {
                log::warn!("end_tx called on table {} without a transaction", self.name);
                false
            },
            Some(tx) if tx.successful => true,
            Some(tx) => {
                self.data = tx.snapshot;
                self.changes.truncate(tx.changes_before);
                log::debug!("Rolled back a transaction on table {}", self.name);
                false
            },
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Run `f` inside a transaction, rolled back if `f` fails
    pub fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        self.begin_tx();
        let result = f(self);
        if result.is_ok() {
            self.set_tx_successful();
        }
        self.end_tx();
        result
    }


    pub fn insert(&mut self, mut row: R) -> RowId {
        let id = self.data.next_id;
        self.data.next_id += 1;
        row.set_row_id(id);
        self.record(RowAction::Insert, id, row.resource_id());
        self.data.rows.insert(id, row);
        id
    }

    /// Replace the row stored under `id`. Returns false if there is no such row
    pub fn update(&mut self, id: RowId, mut row: R) -> bool {
        if !self.data.rows.contains_key(&id) {
            return false;
        }
        row.set_row_id(id);
        self.record(RowAction::Update, id, row.resource_id());
        self.data.rows.insert(id, row);
        true
    }

    /// Delete every row matching `predicate`, returns how many were deleted
    pub fn delete_where<P>(&mut self, mut predicate: P) -> usize
    where
        P: FnMut(&R) -> bool,
    {
        let doomed: Vec<(RowId, ResourceId)> = self.data.rows.iter()
            .filter(|(_, row)| predicate(row))
            .map(|(id, row)| (*id, row.resource_id()))
            .collect();
        for (id, resource_id) in &doomed {
            self.data.rows.remove(id);
            self.record(RowAction::Delete, *id, *resource_id);
        }
        doomed.len()
    }

    pub fn delete_all(&mut self) -> usize {
        self.delete_where(|_| true)
    }

    pub fn get(&self, id: RowId) -> Option<&R> {
        self.data.rows.get(&id)
    }

    pub fn rows(&self) -> impl Iterator<Item = &R> {
        self.data.rows.values()
    }

    /// Clones of the rows matching `predicate`, in insertion order
    pub fn select<P>(&self, mut predicate: P) -> Vec<R>
    where
        P: FnMut(&R) -> bool,
    {
        self.data.rows.values().filter(|row| predicate(row)).cloned().collect()
    }

    /// Take the changes recorded so far.
    /// Changes of a transaction still in progress are left in place
    pub fn take_changes(&mut self) -> Vec<DataChangeEvent> {
        if self.transaction.is_some() {
            return Vec::new();
        }
        std::mem::take(&mut self.changes)
    }

    fn record(&mut self, action: RowAction, row_id: RowId, resource_id: ResourceId) {
        self.changes.push(DataChangeEvent { action, row_id, resource_id });
    }
}
