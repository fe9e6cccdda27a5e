//! The public handle of the alarm queue

use std::sync::Arc;

use tokio::runtime::Handle;

use crate::alarm::request::AlarmRequest;
use crate::alarm::row::{AlarmRow, AlarmState};
use crate::alarm::table::AlarmTableManager;
use crate::change::ListenerSet;
use crate::config::{to_std, Settings, ALARM_META_FILE, ALARM_TABLE_FILE};
use crate::error::{Error, Result};
use crate::meta::{MetaState, MetaStore};
use crate::resource::ResourceChangedEvent;
use crate::table::{RowId, Table};
use crate::traits::{AlarmChangedListener, Clock, RecurrenceExpander, ResourceChangedListener, ResourceStore, WakeupScheduler};
use crate::worker::{self, ChangeForwarder, Responder, Worker};

const NAME: &str = "AlarmQueueManager";

/// The queue of upcoming alarms, and the single OS wakeup for the next one.
///
/// Works like the [`CacheManager`](crate::cache::CacheManager): one worker thread owns the table,
/// and [`Self::close`] must be called for the persisted state to be trusted on the next start.
pub struct AlarmQueueManager {
    worker: Worker<AlarmTableManager>,
    meta: MetaStore,
    store: Arc<dyn ResourceStore>,
    forwarder: Arc<dyn ResourceChangedListener>,
    listeners: ListenerSet<dyn AlarmChangedListener>,
    settings: Settings,
}

impl AlarmQueueManager {
    /// Load the persisted queue, rebuild it if the last run did not close cleanly, then start serving requests.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(
        settings: Settings,
        store: Arc<dyn ResourceStore>,
        expander: Arc<dyn RecurrenceExpander>,
        wakeup: Arc<dyn WakeupScheduler>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        if let Some(dir) = &settings.data_dir {
            std::fs::create_dir_all(dir)?;
        }

        let meta = MetaStore::new(NAME, settings.data_file(ALARM_META_FILE), to_std(settings.meta_lock_timeout));
        let previous = meta.load()?;
        let table = Table::load_or_new("alarms", settings.data_file(ALARM_TABLE_FILE));
        let trusted = match &previous {
            Some(state) if state.is_clean() && state.count == table.len() as i64 => true,
            Some(state) if state.is_clean() => {
                log::warn!("The alarm meta row counts {} rows, the table has {}", state.count, table.len());
                false
            },
            _ => false,
        };

        let (mailbox, inbox) = worker::queue(NAME);
        let listeners = ListenerSet::new();
        let mut processor = AlarmTableManager {
            table,
            settings: settings.alarm.clone(),
            store: Arc::clone(&store),
            expander, wakeup, clock,
            listeners: listeners.clone(),
            runtime,
            mailbox: mailbox.clone(),
        };

        meta.store(&MetaState::new(false, None, processor.table().len()))?;
        if trusted {
            processor.schedule_next();
        } else {
            processor.recover().await?;
        }

        let worker = Worker::spawn(NAME, processor, mailbox.clone(), inbox)?;
        let forwarder: Arc<dyn ResourceChangedListener> = Arc::new(ChangeForwarder::new(mailbox, AlarmRequest::ResourceChanged));
        store.add_listener(Arc::clone(&forwarder));

        Ok(Self { worker, meta, store, forwarder, listeners, settings })
    }

    /// Queue a request. Its outcome is only visible through logs and change events
    pub fn send_request(&self, request: AlarmRequest) -> Result<()> {
        self.worker.send(request)
    }

    /// Queue a request built around `respond`, and wait for its response
    pub async fn send_blocking_request<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce(Responder<T>) -> AlarmRequest,
    {
        self.worker.request(build, to_std(self.settings.alarm.blocking_timeout)).await
    }

    /// Snooze or dismiss the alarm stored as `row_id`
    pub async fn update_alarm_state(&self, row_id: RowId, state: AlarmState) -> Result<AlarmRow> {
        self.send_blocking_request(|respond| AlarmRequest::UpdateState { row_id, state, respond: Some(respond) }).await?
    }

    pub async fn next_alarm(&self) -> Result<Option<AlarmRow>> {
        self.send_blocking_request(AlarmRequest::NextAlarm).await
    }

    pub async fn next_overdue(&self) -> Result<Option<AlarmRow>> {
        self.send_blocking_request(AlarmRequest::NextOverdue).await
    }

    /// Every row, ordered by time to fire
    pub async fn queue(&self) -> Result<Vec<AlarmRow>> {
        self.send_blocking_request(AlarmRequest::Queue).await
    }

    pub fn log_queue(&self) -> Result<()> {
        self.send_request(AlarmRequest::LogQueue)
    }

    pub fn rebuild_queue(&self) -> Result<()> {
        self.send_request(AlarmRequest::RebuildQueue)
    }

    /// Feed a change of the resource store, as the store's own notifications do
    pub fn resource_changed(&self, event: ResourceChangedEvent) -> Result<()> {
        self.send_request(AlarmRequest::ResourceChanged(event))
    }

    /// Every listener added here must be removed before the queue is closed
    pub fn add_listener(&self, listener: Arc<dyn AlarmChangedListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn AlarmChangedListener>) {
        if !self.listeners.remove(listener) {
            log::warn!("Removing an alarm listener that was not registered");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.worker.is_closed()
    }

    /// Stop accepting requests, process the pending ones, then persist the queue and a clean meta row
    pub fn close(&self) -> Result<()> {
        if self.worker.is_closed() {
            return Err(Error::Closed(NAME));
        }
        self.store.remove_listener(&self.forwarder);
        let processor = self.worker.shutdown()?;

        let remaining = self.listeners.len();
        if remaining > 0 {
            log::warn!("{} closed with {} listeners still registered", NAME, remaining);
        }

        processor.save()?;
        self.meta.store(&MetaState::new(true, None, processor.table().len()))?;
        log::info!("{} closed with {} alarms", NAME, processor.table().len());
        Ok(())
    }
}

impl Drop for AlarmQueueManager {
    fn drop(&mut self) {
        if !self.worker.is_closed() {
            log::warn!("{} dropped without being closed", NAME);
            if let Err(err) = self.close() {
                log::error!("Unable to close {}: {}", NAME, err);
            }
        }
    }
}
