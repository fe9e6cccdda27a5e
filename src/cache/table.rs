//! The cache worker: exclusive owner of the occurrence table and of the window

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::runtime::Handle;

use crate::cache::request::CacheRequest;
use crate::cache::row::{CacheRow, ResourceType};
use crate::cache::window::CacheWindow;
use crate::change::{CacheChangedEvent, ListenerSet};
use crate::config::CacheSettings;
use crate::date_range::DateRange;
use crate::error::{Error, Result};
use crate::resource::{Resource, ResourceAction, ResourceChangedEvent, ResourceId};
use crate::table::Table;
use crate::traits::{CacheChangedListener, Clock, RecurrenceExpander, ResourceStore, WidgetRefresher};
use crate::worker::{reply, Mailbox, Processor};

pub(crate) struct CacheTableManager {
    pub(super) table: Table<CacheRow>,
    pub(super) window: CacheWindow,
    /// The range of the fetch in flight, if any
    pub(super) fetching: Option<DateRange>,
    /// Latest state of the resources changed while a fetch is in flight, `None` once deleted.
    /// The fetch may have read them before the change
    pub(super) changed_while_fetching: HashMap<ResourceId, Option<Resource>>,
    pub(super) settings: CacheSettings,
    pub(super) store: Arc<dyn ResourceStore>,
    pub(super) expander: Arc<dyn RecurrenceExpander>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) widgets: Option<Arc<dyn WidgetRefresher>>,
    pub(super) listeners: ListenerSet<dyn CacheChangedListener>,
    pub(super) runtime: Handle,
    pub(super) mailbox: Mailbox<CacheRequest>,
}

impl CacheTableManager {
    pub fn table(&self) -> &Table<CacheRow> {
        &self.table
    }

    pub fn window(&self) -> &CacheWindow {
        &self.window
    }

    /// The offset to subtract from floating instants, for a query starting at `at`
    fn offset_at(&self, at: DateTime<Utc>) -> Duration {
        Duration::seconds(self.clock.local_offset(at).local_minus_utc() as i64)
    }

    /// Rows whose effective `[start, end)` intersects `range`, ordered by effective start
    pub fn query_in_range(&self, range: &DateRange, filter: Option<ResourceType>) -> Vec<CacheRow> {
        let offset = self.offset_at(range.start);
        let mut rows = self.table.select(|row| {
            filter.map_or(true, |t| row.resource_type() == t) && row.intersects(range, offset)
        });
        rows.sort_by_key(|row| row.effective_start(offset));
        rows
    }

    /// The first `count` rows of the next days
    pub fn next_objects(&self, count: usize, filter: Option<ResourceType>) -> Vec<CacheRow> {
        let now = self.clock.now();
        let range = DateRange::new(now, now + self.settings.next_objects_horizon);
        let mut rows = self.query_in_range(&range, filter);
        rows.truncate(count);
        rows
    }

    /// Whether the window covers `range`.
    ///
    /// If it does not, the requested window grows to include `range` and a fetch is started:
    /// the caller will be notified by a change event once the rows are there.
    /// A range longer than the window can hold is checked for its part nearer to now.
    pub fn check_window(&mut self, range: &DateRange) -> bool {
        let range = &self.window.clip_request(range, self.clock.now());
        if self.window.is_within_window(range) {
            if let Some(extension) = self.window.proactive_extension(range) {
                if !self.window.is_requested(&extension) {
                    log::debug!("{} is close to the edge of the window, extending it by {}", range, extension);
                    self.window.add_unpadded_request(&extension);
                    self.start_fetch();
                }
            }
            return true;
        }
        self.update_window_to_include(range);
        false
    }

    pub fn update_window_to_include(&mut self, range: &DateRange) {
        if !self.window.is_requested(range) {
            self.window.add_to_requested_range(range, self.clock.now());
        }
        self.start_fetch();
    }

    /// Fetch the requested window from the store, unless a fetch is already in flight.
    /// The result comes back to this worker as an [`CacheRequest::AddRangeResult`]
    fn start_fetch(&mut self) {
        if self.fetching.is_some() {
            log::debug!("A fetch is in flight already, {:?} will wait for it", self.window.requested_window());
            return;
        }
        let range = match self.window.requested_window() {
            None => return,
            Some(r) => r,
        };
        self.fetching = Some(range);
        log::debug!("Fetching resources in {}", range);

        let store = Arc::clone(&self.store);
        let expander = Arc::clone(&self.expander);
        let mailbox = self.mailbox.clone();
        self.runtime.spawn(async move {
            let request = match store.get_resources_in_range(&range).await {
                Ok(resources) => CacheRequest::AddRangeResult {
                    range,
                    rows: expand_resources(expander.as_ref(), &resources, &range),
                },
                Err(err) => CacheRequest::FetchFailed { range, error: err.to_string() },
            };
            if let Err(err) = mailbox.send(request) {
                log::warn!("Dropping the fetch result for {}: {}", range, err);
            }
        });
    }

    /// Replace whatever the table holds in `range` with `rows`, then grow the window to `range`.
    ///
    /// Resources that changed while the fetch was in flight are expanded again from their latest state.
    pub fn add_range_result(&mut self, range: DateRange, mut rows: Vec<CacheRow>) {
        if self.fetching == Some(range) {
            self.fetching = None;
        }
        let changed = std::mem::take(&mut self.changed_while_fetching);
        if !changed.is_empty() {
            rows.retain(|row| !changed.contains_key(&row.resource_id()));
            let latest: Vec<Resource> = changed.into_iter()
                .filter_map(|(_, resource)| resource)
                .filter(|r| r.collection_id() >= 1 && r.may_intersect(&range))
                .collect();
            log::debug!("{} resources changed during the fetch of {}, expanding them again", latest.len(), range);
            rows.extend(expand_resources(self.expander.as_ref(), &latest, &range));
        }
        let offset = self.offset_at(range.start);
        let result = self.table.transaction(|table| {
            let replaced = table.delete_where(|row| row.is_dated() && row.intersects(&range, offset));
            log::debug!("Replacing {} rows in {} with {} new ones", replaced, range, rows.len());
            for row in rows {
                if !row.is_dated() {
                    // Dateless tasks are found by every fetch
                    table.delete_where(|r| r.resource_id() == row.resource_id() && r.start() == row.start() && r.end() == row.end());
                }
                table.insert(row);
            }
            Ok(())
        });
        if let Err(err) = result {
            log::error!("Unable to store the occurrences of {}: {}", range, err);
            self.data_changed(true);
            return;
        }

        let evicted = self.window.expand_window(&range, self.clock.now());
        if !evicted.is_empty() {
            self.evict_outside_window();
        }
        self.data_changed(true);
        self.start_fetch();
    }

    fn fetch_failed(&mut self, range: DateRange, error: &str) {
        log::error!("{}", Error::Store(format!("unable to fetch resources in {}: {}", range, error)));
        if self.fetching == Some(range) {
            self.fetching = None;
        }
        self.changed_while_fetching.clear();
    }

    /// Recompute the rows of the resources of `event`, all of them in one transaction
    pub fn resource_changed(&mut self, event: &ResourceChangedEvent) {
        if self.fetching.is_some() {
            for change in event.changes() {
                match change.action {
                    ResourceAction::Delete => { self.changed_while_fetching.insert(change.resource_id, None); },
                    _ => if let Some(resource) = &change.resource {
                        self.changed_while_fetching.insert(change.resource_id, Some(resource.clone()));
                    },
                }
            }
        }

        let current = match self.window.current_window() {
            None => {
                log::debug!("No window yet, ignoring {} resource changes", event.changes().len());
                return;
            },
            Some(c) => c,
        };

        let mut replacements: Vec<(ResourceId, Vec<CacheRow>)> = Vec::new();
        for change in event.changes() {
            match change.action {
                ResourceAction::Delete => replacements.push((change.resource_id, Vec::new())),
                ResourceAction::Insert | ResourceAction::Update | ResourceAction::Pending => {
                    let resource = match &change.resource {
                        Some(r) if r.kind().is_some() => r,
                        _ => continue,
                    };
                    if !resource.may_intersect(&current) {
                        // It may have been moved out of the window
                        replacements.push((resource.resource_id(), Vec::new()));
                        continue;
                    }
                    match self.expander.instances_between(resource, &current) {
                        Ok(rows) => replacements.push((resource.resource_id(), rows)),
                        Err(err) => log::error!("{}", Error::Expansion { resource_id: resource.resource_id(), message: err.to_string() }),
                    }
                },
            }
        }
        if replacements.is_empty() {
            return;
        }

        let result = self.table.transaction(|table| {
            for (resource_id, rows) in replacements {
                delete_resource_rows(table, resource_id);
                for row in rows {
                    if row.collection_id() < 1 {
                        return Err(Error::InvalidRow(format!(
                            "occurrence {} of resource {} has an invalid collection id {}",
                            row.recurrence_id(), resource_id, row.collection_id())));
                    }
                    table.insert(row);
                }
            }
            Ok(())
        });
        if let Err(err) = result {
            log::error!("Error handling a resource change, nothing was changed: {}", err);
        }
        self.data_changed(false);
    }

    /// Drop every row and forget the window
    pub fn clear_cache(&mut self) {
        let result = self.table.transaction(|table| Ok(table.delete_all()));
        match result {
            Ok(n) => log::info!("Cleared {} cached occurrences", n),
            Err(err) => log::error!("Unable to clear the cache: {}", err),
        }
        self.window.reset();
        self.data_changed(true);
    }

    /// Clear the cache, then fetch the default window again, without padding
    pub fn rebuild_cache(&mut self) {
        self.clear_cache();
        let range = self.window.default_range(self.clock.now());
        self.window.add_unpadded_request(&range);
        self.start_fetch();
    }

    /// Shrink the window, and drop the rows that no longer intersect it
    pub fn remove_range_from_window(&mut self, range: &DateRange) {
        let evicted = self.window.reduce_window(range, self.clock.now(), false);
        if evicted.is_empty() {
            return;
        }
        self.evict_outside_window();
        self.data_changed(true);
    }

    fn evict_outside_window(&mut self) {
        let current = self.window.current_window();
        let offset = current.map_or_else(Duration::zero, |c| self.offset_at(c.start));
        let result = self.table.transaction(|table| {
            Ok(table.delete_where(|row| {
                row.is_dated() && current.map_or(true, |c| !row.intersects(&c, offset))
            }))
        });
        match result {
            Ok(n) => log::debug!("Evicted {} occurrences", n),
            Err(err) => log::error!("Unable to evict occurrences: {}", err),
        }
    }

    /// Tell listeners about the changes committed since the last call
    pub fn data_changed(&mut self, window_only: bool) {
        let changes = self.table.take_changes();
        if changes.is_empty() {
            return;
        }
        let event = CacheChangedEvent::new(changes, window_only);
        for listener in self.listeners.snapshot() {
            listener.cache_changed(&event);
        }
        if let Some(widgets) = &self.widgets {
            widgets.refresh_widgets();
        }
    }

    /// Rebuild the table from scratch after an unclean shutdown: clear it, then fetch and store
    /// the default window before anything else happens
    pub async fn recover(&mut self) -> Result<()> {
        log::warn!("Cache was not closed cleanly, rebuilding it");
        self.table.delete_all();
        self.table.take_changes();
        self.window.reset();
        self.fetching = None;
        self.changed_while_fetching.clear();

        let range = self.window.default_range(self.clock.now());
        let resources = self.store
            .get_resources_in_range(&range)
            .await
            .map_err(|err| Error::Store(err.to_string()))?;
        let rows = expand_resources(self.expander.as_ref(), &resources, &range);
        log::info!("Rebuilt the cache with {} occurrences of {} resources in {}", rows.len(), resources.len(), range);
        self.add_range_result(range, rows);
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        self.table.save_to_file()
    }
}

fn delete_resource_rows(table: &mut Table<CacheRow>, resource_id: ResourceId) -> usize {
    table.delete_where(|row| row.resource_id() == resource_id)
}

/// Occurrences of `resources` in `range`. Resources that fail to expand are skipped
fn expand_resources(expander: &dyn RecurrenceExpander, resources: &[Resource], range: &DateRange) -> Vec<CacheRow> {
    let mut rows = Vec::new();
    for resource in resources.iter().filter(|r| r.kind().is_some()) {
        match expander.instances_between(resource, range) {
            Ok(mut instances) => rows.append(&mut instances),
            Err(err) => log::warn!("{}", Error::Expansion { resource_id: resource.resource_id(), message: err.to_string() }),
        }
    }
    rows
}


impl Processor for CacheTableManager {
    type Request = CacheRequest;

    fn process(&mut self, request: CacheRequest) {
        match request {
            CacheRequest::ObjectsInRange { range, filter, respond } => {
                let range = self.window.clip_request(&range, self.clock.now());
                let rows = if self.check_window(&range) {
                    self.query_in_range(&range, filter)
                } else {
                    Vec::new()
                };
                if let Some(respond) = respond {
                    reply(respond, rows, "ObjectsInRange");
                }
            },
            CacheRequest::NextObjects { count, filter, respond } => {
                reply(respond, self.next_objects(count, filter), "NextObjects");
            },
            CacheRequest::CheckWindow { range, respond } => {
                let covered = self.check_window(&range);
                if let Some(respond) = respond {
                    reply(respond, covered, "CheckWindow");
                }
            },
            CacheRequest::CurrentWindow(respond) => reply(respond, self.window.clone(), "CurrentWindow"),
            CacheRequest::ReduceRange(range) => self.remove_range_from_window(&range),
            CacheRequest::ClearCache => self.rebuild_cache(),
            CacheRequest::ResourceChanged(event) => self.resource_changed(&event),
            CacheRequest::AddRangeResult { range, rows } => self.add_range_result(range, rows),
            CacheRequest::FetchFailed { range, error } => self.fetch_failed(range, &error),
        }
    }

    fn describe(request: &CacheRequest) -> &'static str {
        request.name()
    }

    fn abort_open_transaction(&mut self) -> bool {
        if !self.table.in_transaction() {
            return false;
        }
        self.table.end_tx();
        true
    }
}
