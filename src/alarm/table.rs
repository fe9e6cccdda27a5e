//! The alarm worker: exclusive owner of the alarm table and of the wakeup

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::runtime::Handle;

use crate::alarm::request::AlarmRequest;
use crate::alarm::row::{AlarmRow, AlarmState};
use crate::change::{AlarmChangedEvent, ListenerSet};
use crate::config::AlarmSettings;
use crate::date_range::DateRange;
use crate::error::{Error, Result};
use crate::resource::{Resource, ResourceAction, ResourceChangedEvent, ResourceId};
use crate::table::{RowId, Table};
use crate::traits::{AlarmChangedListener, Clock, RecurrenceExpander, ResourceStore, WakeupScheduler};
use crate::worker::{reply, Mailbox, Processor};

pub(crate) struct AlarmTableManager {
    pub(super) table: Table<AlarmRow>,
    pub(super) settings: AlarmSettings,
    pub(super) store: Arc<dyn ResourceStore>,
    pub(super) expander: Arc<dyn RecurrenceExpander>,
    pub(super) wakeup: Arc<dyn WakeupScheduler>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) listeners: ListenerSet<dyn AlarmChangedListener>,
    pub(super) runtime: Handle,
    pub(super) mailbox: Mailbox<AlarmRequest>,
}

/// What a resource change does to the alarms of one resource
enum Replacement {
    /// Recomputed triggers, sorted by time to fire
    Triggers(ResourceId, Vec<AlarmRow>),
    Removed(ResourceId),
}

impl AlarmTableManager {
    pub fn table(&self) -> &Table<AlarmRow> {
        &self.table
    }

    /// Alarms can only come from calendar resources that have some content
    fn has_alarms(resource: &Resource) -> bool {
        resource.kind().is_some() && !resource.payload().is_empty()
    }

    fn is_dismissed(table: &Table<AlarmRow>, alarm: &AlarmRow) -> bool {
        table.rows().any(|row| row.state() == AlarmState::Dismissed && row.same_trigger(alarm))
    }

    /// Throw away every active row, and replace them with the triggers of `resources`
    /// that have not been dismissed yet
    pub fn rebuild(&mut self, resources: &[Resource]) {
        let now = self.clock.now();
        let range = DateRange::new(now - self.settings.rebuild_lookback, now + self.settings.lookahead);
        log::info!("Rebuilding the alarm queue from {} resources over {}", resources.len(), range);

        let mut staged: Vec<AlarmRow> = Vec::new();
        for resource in resources.iter().filter(|r| Self::has_alarms(r)) {
            let alarms = match self.expander.alarms_between(resource, &range) {
                Ok(alarms) => alarms,
                Err(err) => {
                    log::error!("{}", Error::Expansion { resource_id: resource.resource_id(), message: err.to_string() });
                    continue;
                },
            };
            for alarm in alarms {
                if Self::is_dismissed(&self.table, &alarm) {
                    log::debug!("Skipping {}", alarm);
                } else if !staged.iter().any(|s| s.same_trigger(&alarm)) {
                    staged.push(alarm.into_pending());
                }
            }
        }

        let count = staged.len();
        let result = self.table.transaction(|table| {
            table.delete_where(|row| row.state() != AlarmState::Dismissed);
            for alarm in staged {
                table.insert(alarm);
            }
            Ok(())
        });
        match result {
            Ok(()) => log::info!("{} alarms added", count),
            Err(err) => log::error!("Unable to rebuild the alarm queue: {}", err),
        }
        self.data_changed();
        self.schedule_next();
    }

    /// Where the trigger search of a resource starts: now, or just after
    /// a dismissal of this resource that fired moments ago.
    /// Dismissed triggers still in the future do not move the search.
    fn search_start(&self, resource_id: ResourceId, now: DateTime<Utc>) -> DateTime<Utc> {
        let grace_start = now - self.settings.dismissal_grace;
        self.table.rows()
            .filter(|row| row.resource_id() == resource_id && row.state() == AlarmState::Dismissed)
            .map(|row| row.time_to_fire())
            .filter(|ttf| *ttf >= grace_start && *ttf <= now)
            .max()
            .map_or(now, |ttf| ttf + Duration::milliseconds(1))
    }

    /// Recompute the alarms of the resources of `event`, all of them in one transaction
    pub fn process_changes(&mut self, event: &ResourceChangedEvent) {
        let now = self.clock.now();
        let mut replacements = Vec::new();
        for change in event.changes() {
            match change.action {
                ResourceAction::Delete => replacements.push(Replacement::Removed(change.resource_id)),
                ResourceAction::Insert | ResourceAction::Update | ResourceAction::Pending => {
                    let resource = match &change.resource {
                        Some(r) if Self::has_alarms(r) => r,
                        _ => continue,
                    };
                    let after = self.search_start(resource.resource_id(), now);
                    let range = DateRange::new(after, after + self.settings.lookahead);
                    match self.expander.alarms_between(resource, &range) {
                        Ok(mut alarms) => {
                            alarms.sort_by_key(|a| a.time_to_fire());
                            replacements.push(Replacement::Triggers(resource.resource_id(), alarms));
                        },
                        Err(err) => log::error!("{}", Error::Expansion { resource_id: resource.resource_id(), message: err.to_string() }),
                    }
                },
            }
        }
        if replacements.is_empty() {
            return;
        }

        let result = self.table.transaction(|table| {
            for replacement in replacements {
                match replacement {
                    Replacement::Triggers(resource_id, alarms) => populate_from_resource(table, resource_id, alarms, now),
                    Replacement::Removed(resource_id) => {
                        table.delete_where(|row| row.resource_id() == resource_id && row.state() != AlarmState::Dismissed);
                    },
                }
            }
            Ok(())
        });
        if let Err(err) = result {
            log::error!("Error processing resource changes: {}", err);
        }

        self.data_changed();
        if log::log_enabled!(log::Level::Debug) {
            self.log_queue();
        }
        self.schedule_next();
    }

    /// Snooze or dismiss an alarm, and purge the alarms that are too old to matter
    pub fn update_alarm_state(&mut self, row_id: RowId, state: AlarmState) -> Result<AlarmRow> {
        let now = self.clock.now();
        let snooze = self.settings.snooze_duration();
        let threshold = now - self.settings.retention;

        let result = self.table.transaction(|table| {
            let mut row = table.get(row_id).cloned().ok_or(Error::AlarmNotFound(row_id))?;
            row.transition(state, now, snooze)?;
            table.update(row_id, row.clone());

            let purged = table.delete_where(|r| r.time_to_fire() < threshold);
            if purged > 0 {
                log::debug!("Purged {} old alarms", purged);
            }
            Ok(row)
        });
        match &result {
            Ok(row) => log::info!("Alarm {} is now {}", row_id, row),
            Err(err) => log::warn!("Unable to update alarm {}: {}", row_id, err),
        }

        self.data_changed();
        self.schedule_next();
        result
    }

    /// The active alarm that fires first
    pub fn next_alarm(&self) -> Option<AlarmRow> {
        self.table.rows()
            .filter(|row| row.state().is_active())
            .min_by_key(|row| row.time_to_fire())
            .cloned()
    }

    /// The active alarm that should have fired first
    pub fn next_overdue(&mut self) -> Option<AlarmRow> {
        let now = self.clock.now();
        let overdue = self.table.rows()
            .filter(|row| row.state().is_active() && row.time_to_fire() <= now)
            .min_by_key(|row| row.time_to_fire())
            .cloned();
        if overdue.is_none() {
            self.schedule_next();
        }
        overdue
    }

    /// Register the one wakeup for the next active alarm, or none if there is no such alarm
    pub fn schedule_next(&self) {
        match self.next_alarm() {
            Some(next) => {
                let ttf = next.time_to_fire();
                log::info!("Scheduling the alarm wakeup for {} ({}s from now)", ttf.to_rfc3339(), (ttf - self.clock.now()).num_seconds());
                self.wakeup.schedule(ttf);
            },
            None => {
                log::info!("No alarms scheduled");
                self.wakeup.cancel();
            },
        }
    }

    pub fn queue(&self) -> Vec<AlarmRow> {
        let mut rows = self.table.select(|_| true);
        rows.sort_by_key(|row| row.time_to_fire());
        rows
    }

    pub fn log_queue(&self) {
        log::info!("Alarm queue at {}", self.clock.now().to_rfc3339());
        for row in self.queue() {
            log::info!("{}", row);
        }
    }

    /// Drop every row, then have the resources with alarms fetched for a rebuild
    pub fn rebuild_queue(&mut self) {
        let result = self.table.transaction(|table| Ok(table.delete_all()));
        if let Err(err) = result {
            log::error!("Unable to clear the alarm queue: {}", err);
        }
        self.data_changed();

        let store = Arc::clone(&self.store);
        let mailbox = self.mailbox.clone();
        self.runtime.spawn(async move {
            match store.get_resources_with_alarms().await {
                Ok(resources) => {
                    if let Err(err) = mailbox.send(AlarmRequest::Rebuild { resources }) {
                        log::warn!("Dropping the alarm rebuild: {}", err);
                    }
                },
                Err(err) => log::error!("{}", Error::Store(format!("unable to fetch the resources with alarms: {}", err))),
            }
        });
    }

    /// Start over from an empty table after an unclean shutdown
    pub async fn recover(&mut self) -> Result<()> {
        log::warn!("Alarm queue was not closed cleanly, rebuilding it");
        self.table.delete_all();
        self.table.take_changes();
        let resources = self.store
            .get_resources_with_alarms()
            .await
            .map_err(|err| Error::Store(err.to_string()))?;
        self.rebuild(&resources);
        Ok(())
    }

    fn data_changed(&mut self) {
        let changes = self.table.take_changes();
        if changes.is_empty() {
            return;
        }
        let event = AlarmChangedEvent::new(changes);
        for listener in self.listeners.snapshot() {
            listener.alarm_changed(&event);
        }
    }

    pub fn save(&self) -> Result<()> {
        self.table.save_to_file()
    }
}

/// Store the triggers computed for a resource.
///
/// Stale pending rows go; dismissed triggers are never brought back;
/// snoozed triggers keep their snooze unless they are overdue already.
fn populate_from_resource(table: &mut Table<AlarmRow>, resource_id: ResourceId, alarms: Vec<AlarmRow>, now: DateTime<Utc>) {
    table.delete_where(|row| row.resource_id() == resource_id && row.state() == AlarmState::Pending);

    for alarm in alarms {
        let existing = table.select(|row| row.same_trigger(&alarm)).into_iter().next();
        match existing {
            None => { table.insert(alarm.into_pending()); },
            Some(row) => match (row.state(), row.id()) {
                (AlarmState::Snoozed, Some(id)) => {
                    if alarm.time_to_fire() < now {
                        continue;
                    }
                    table.update(id, row.refreshed_from(&alarm));
                },
                // dismissed, or computed twice
                _ => log::trace!("Skipping {}", alarm),
            },
        }
    }
}


impl Processor for AlarmTableManager {
    type Request = AlarmRequest;

    fn process(&mut self, request: AlarmRequest) {
        match request {
            AlarmRequest::UpdateState { row_id, state, respond } => {
                let result = self.update_alarm_state(row_id, state);
                if let Some(respond) = respond {
                    reply(respond, result, "UpdateState");
                }
            },
            AlarmRequest::NextAlarm(respond) => reply(respond, self.next_alarm(), "NextAlarm"),
            AlarmRequest::NextOverdue(respond) => {
                let overdue = self.next_overdue();
                reply(respond, overdue, "NextOverdue");
            },
            AlarmRequest::Queue(respond) => reply(respond, self.queue(), "Queue"),
            AlarmRequest::LogQueue => self.log_queue(),
            AlarmRequest::RebuildQueue => self.rebuild_queue(),
            AlarmRequest::ResourceChanged(event) => self.process_changes(&event),
            AlarmRequest::Rebuild { resources } => self.rebuild(&resources),
        }
    }

    fn describe(request: &AlarmRequest) -> &'static str {
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
