//! The public handle of the occurrence cache

use std::collections::HashMap;
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::cache::request::CacheRequest;
use crate::cache::row::{CacheRow, ResourceType};
use crate::cache::table::CacheTableManager;
use crate::cache::window::CacheWindow;
use crate::change::ListenerSet;
use crate::config::{to_std, Settings, CACHE_META_FILE, CACHE_TABLE_FILE};
use crate::date_range::DateRange;
use crate::error::{Error, Result};
use crate::meta::{MetaState, MetaStore};
use crate::resource::ResourceChangedEvent;
use crate::table::Table;
use crate::traits::{CacheChangedListener, Clock, RecurrenceExpander, ResourceChangedListener, ResourceStore, SystemClock, WidgetRefresher};
use crate::worker::{self, ChangeForwarder, Responder, Worker};

const NAME: &str = "CacheManager";

/// The occurrence cache.
///
/// Every operation is processed in order by a dedicated worker thread, which is the only one to touch the table.
/// Call [`Self::close`] when done: it drains the pending requests and marks the persisted state as clean.
/// A cache that was not closed is rebuilt from scratch on the next start.
pub struct CacheManager {
    worker: Worker<CacheTableManager>,
    meta: MetaStore,
    store: Arc<dyn ResourceStore>,
    forwarder: Arc<dyn ResourceChangedListener>,
    listeners: ListenerSet<dyn CacheChangedListener>,
    settings: Settings,
}

/// Options of a [`CacheManager`] about to start
pub struct CacheManagerBuilder {
    settings: Settings,
    store: Arc<dyn ResourceStore>,
    expander: Arc<dyn RecurrenceExpander>,
    clock: Arc<dyn Clock>,
    widgets: Option<Arc<dyn WidgetRefresher>>,
}

impl CacheManagerBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Widgets to refresh whenever the cached occurrences change
    pub fn widget_refresher(mut self, widgets: Arc<dyn WidgetRefresher>) -> Self {
        self.widgets = Some(widgets);
        self
    }

    /// Load the persisted state, rebuild it if the last run did not close cleanly, then start serving requests.
    ///
    /// Must be called from within a tokio runtime: fetches from the resource store run on it.
    pub async fn start(self) -> Result<CacheManager> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let settings = self.settings;
        if let Some(dir) = &settings.data_dir {
            std::fs::create_dir_all(dir)?;
        }

        let meta = MetaStore::new(NAME, settings.data_file(CACHE_META_FILE), to_std(settings.meta_lock_timeout));
        let previous = meta.load()?;
        let table = Table::load_or_new("cache", settings.data_file(CACHE_TABLE_FILE));
        let trusted = match &previous {
            None => false,
            Some(state) if !state.is_clean() => false,
            Some(state) if state.count != table.len() as i64 => {
                log::warn!("The cache meta row counts {} rows, the table has {}", state.count, table.len());
                false
            },
            Some(_) => true,
        };
        let window = CacheWindow::with_current(
            settings.cache.clone(),
            previous.as_ref().filter(|_| trusted).and_then(MetaState::window),
        );

        let (mailbox, inbox) = worker::queue(NAME);
        let listeners = ListenerSet::new();
        let mut processor = CacheTableManager {
            table, window,
            fetching: None,
            changed_while_fetching: HashMap::new(),
            settings: settings.cache.clone(),
            store: Arc::clone(&self.store),
            expander: self.expander,
            clock: Arc::clone(&self.clock),
            widgets: self.widgets,
            listeners: listeners.clone(),
            runtime,
            mailbox: mailbox.clone(),
        };

        meta.store(&MetaState::new(false, processor.window().current_window(), processor.table().len()))?;
        if !trusted {
            processor.recover().await?;
        }
        let default_range = processor.window().default_range(self.clock.now());

        let worker = Worker::spawn(NAME, processor, mailbox.clone(), inbox)?;
        let forwarder: Arc<dyn ResourceChangedListener> = Arc::new(ChangeForwarder::new(mailbox, CacheRequest::ResourceChanged));
        self.store.add_listener(Arc::clone(&forwarder));

        let manager = CacheManager {
            worker, meta, forwarder, listeners, settings,
            store: self.store,
        };
        manager.send_request(CacheRequest::ObjectsInRange { range: default_range, filter: None, respond: None })?;
        Ok(manager)
    }
}

impl CacheManager {
    pub fn builder(settings: Settings, store: Arc<dyn ResourceStore>, expander: Arc<dyn RecurrenceExpander>) -> CacheManagerBuilder {
        CacheManagerBuilder {
            settings, store, expander,
            clock: Arc::new(SystemClock),
            widgets: None,
        }
    }

    /// Start a cache with the default options
    pub async fn start(settings: Settings, store: Arc<dyn ResourceStore>, expander: Arc<dyn RecurrenceExpander>, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::builder(settings, store, expander).clock(clock).start().await
    }

    /// Queue a request. Its outcome is only visible through logs and change events
    pub fn send_request(&self, request: CacheRequest) -> Result<()> {
        self.worker.send(request)
    }

    /// Queue a request built around `respond`, and wait for its response
    pub async fn send_blocking_request<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce(Responder<T>) -> CacheRequest,
    {
        self.worker.request(build, to_std(self.settings.cache.blocking_timeout)).await
    }

    pub async fn objects_in_range(&self, range: DateRange, filter: Option<ResourceType>) -> Result<Vec<CacheRow>> {
        self.send_blocking_request(|respond| CacheRequest::ObjectsInRange { range, filter, respond: Some(respond) }).await
    }

    pub async fn check_window(&self, range: DateRange) -> Result<bool> {
        self.send_blocking_request(|respond| CacheRequest::CheckWindow { range, respond: Some(respond) }).await
    }

    pub async fn next_objects(&self, count: usize, filter: Option<ResourceType>) -> Result<Vec<CacheRow>> {
        self.send_blocking_request(|respond| CacheRequest::NextObjects { count, filter, respond }).await
    }

    pub async fn current_window(&self) -> Result<CacheWindow> {
        self.send_blocking_request(CacheRequest::CurrentWindow).await
    }

    /// Feed a change of the resource store, as the store's own notifications do
    pub fn resource_changed(&self, event: ResourceChangedEvent) -> Result<()> {
        self.send_request(CacheRequest::ResourceChanged(event))
    }

    /// Every listener added here must be removed before the cache is closed
    pub fn add_listener(&self, listener: Arc<dyn CacheChangedListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn CacheChangedListener>) {
        if !self.listeners.remove(listener) {
            log::warn!("Removing a cache listener that was not registered");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.worker.is_closed()
    }

    /// Stop accepting requests, process the pending ones, then persist the table and a clean meta row
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
        self.meta.store(&MetaState::new(true, processor.window().current_window(), processor.table().len()))?;
        log::info!("{} closed with {} rows", NAME, processor.table().len());
        Ok(())
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        if !self.worker.is_closed() {
            log::warn!("{} dropped without being closed", NAME);
            if let Err(err) = self.close() {
                log::error!("Unable to close {}: {}", NAME, err);
            }
        }
    }
}
