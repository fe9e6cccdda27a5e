//! Mock collaborators shared by the integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, TimeZone, Utc};

use acal_cache::alarm::AlarmRow;
use acal_cache::cache::{CacheFlags, CacheRow, ResourceType};
use acal_cache::change::{AlarmChangedEvent, CacheChangedEvent};
use acal_cache::resource::{CollectionId, Resource, ResourceChange, ResourceChangedEvent, ResourceId};
use acal_cache::traits::{
    AlarmChangedListener, CacheChangedListener, Clock, CollaboratorError, RecurrenceExpander,
    ResourceChangedListener, ResourceStore, WakeupScheduler, WidgetRefresher,
};
use acal_cache::DateRange;

pub const COLLECTION: CollectionId = 1;

/// How long an occurrence of a test resource lasts
pub fn occurrence_length() -> Duration {
    Duration::hours(1)
}

/// How long before an occurrence its alarm fires
pub fn alarm_advance() -> Duration {
    Duration::minutes(15)
}

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn date(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}


/// Build a resource whose payload lists the start of each of its occurrences
pub fn resource(resource_id: ResourceId, starts: &[DateTime<Utc>]) -> Resource {
    resource_in(resource_id, COLLECTION, starts)
}

pub fn resource_in(resource_id: ResourceId, collection_id: CollectionId, starts: &[DateTime<Utc>]) -> Resource {
    let payload = starts.iter().map(|s| s.to_rfc3339()).collect::<Vec<_>>().join(" ");
    let first = starts.iter().min().copied();
    let last = starts.iter().max().map(|s| *s + occurrence_length());
    Resource::new(resource_id, collection_id, Some(ResourceType::Event), payload).with_span(first, last)
}

/// Like [`resource`], with occurrences at wall-clock times of the viewer's timezone.
/// The starts are those wall-clock readings taken as UTC, and the resource has no span hints
pub fn floating(resource_id: ResourceId, starts: &[DateTime<Utc>]) -> Resource {
    let payload = format!("{} {}", FLOATING, resource(resource_id, starts).payload());
    Resource::new(resource_id, COLLECTION, Some(ResourceType::Event), payload)
}

const FLOATING: &str = "floating";

/// `count` daily occurrences, the first one at `first`
pub fn daily(resource_id: ResourceId, first: DateTime<Utc>, count: i64) -> Resource {
    let starts: Vec<_> = (0..count).map(|n| first + Duration::days(n)).collect();
    resource(resource_id, &starts)
}


/// Expands the payloads built by [`resource`]: one occurrence per listed start,
/// each with an alarm `alarm_advance()` before it
#[derive(Default)]
pub struct FakeExpander {
    calls: AtomicUsize,
}

impl FakeExpander {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn starts(resource: &Resource) -> Result<Vec<DateTime<Utc>>, CollaboratorError> {
        resource.payload()
            .split_whitespace()
            .filter(|s| *s != FLOATING)
            .map(|s| DateTime::parse_from_rfc3339(s).map(|d| d.with_timezone(&Utc)).map_err(|err| err.into()))
            .collect()
    }
}

impl RecurrenceExpander for FakeExpander {
    fn instances_between(&self, resource: &Resource, range: &DateRange) -> Result<Vec<CacheRow>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let kind = resource.kind().ok_or("not a calendar resource")?;
        let starts = Self::starts(resource)?;
        let mut flags = if starts.len() > 1 { CacheFlags::RECURS | CacheFlags::HAS_ALARM } else { CacheFlags::HAS_ALARM };
        if resource.payload().starts_with(FLOATING) {
            flags |= CacheFlags::START_FLOATING | CacheFlags::END_FLOATING;
        }
        Ok(starts.into_iter()
            .filter(|start| DateRange::new(*start, *start + occurrence_length()).intersects(range))
            .map(|start| {
                CacheRow::new(resource.resource_id(), resource.collection_id(), start.to_rfc3339(), kind,
                              Some(start), Some(start + occurrence_length()))
                    .with_summary(&format!("Occurrence of {}", resource.resource_id()))
                    .with_flags(flags)
            })
            .collect())
    }

    fn alarms_between(&self, resource: &Resource, range: &DateRange) -> Result<Vec<AlarmRow>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let starts = Self::starts(resource)?;
        Ok(starts.into_iter()
            .map(|start| (start, start - alarm_advance()))
            .filter(|(_, trigger)| range.contains(*trigger))
            .map(|(start, trigger)| {
                AlarmRow::new(resource.resource_id(), resource.collection_id(), start.to_rfc3339(), trigger)
                    .with_summary(&format!("Alarm of {}", resource.resource_id()))
            })
            .collect())
    }
}


/// A resource store that lives in memory, and notifies its listeners when told to
#[derive(Default)]
pub struct MockResourceStore {
    resources: Mutex<BTreeMap<ResourceId, Resource>>,
    listeners: Mutex<Vec<Arc<dyn ResourceChangedListener>>>,
    fetches: AtomicUsize,
    paused: AtomicBool,
    failing: AtomicBool,
}

impl MockResourceStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_resources(resources: Vec<Resource>) -> Arc<Self> {
        let store = Self::new();
        for resource in resources {
            store.put(resource);
        }
        store
    }

    /// Store a resource without telling anyone
    pub fn put(&self, resource: Resource) {
        self.resources.lock().unwrap().insert(resource.resource_id(), resource);
    }

    pub fn insert(&self, resource: Resource) {
        self.put(resource.clone());
        self.notify(ResourceChangedEvent::new(vec![ResourceChange::inserted(resource)]));
    }

    pub fn update(&self, resource: Resource) {
        self.put(resource.clone());
        self.notify(ResourceChangedEvent::new(vec![ResourceChange::updated(resource)]));
    }

    pub fn delete(&self, resource_id: ResourceId) {
        let removed = self.resources.lock().unwrap().remove(&resource_id);
        let collection_id = removed.map_or(COLLECTION, |r| r.collection_id());
        self.notify(ResourceChangedEvent::new(vec![ResourceChange::deleted(resource_id, collection_id)]));
    }

    pub fn notify(&self, event: ResourceChangedEvent) {
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.resource_changed(event.clone());
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Hold the result of every fetch until [`Self::resume`] is called.
    /// The resources are read before waiting, so a held fetch misses later changes
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    async fn fetch(&self) -> Result<Vec<Resource>, CollaboratorError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let snapshot: Vec<Resource> = self.resources.lock().unwrap().values().cloned().collect();
        while self.paused.load(Ordering::SeqCst) {
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err("the store is unreachable".into());
        }
        Ok(snapshot)
    }
}

#[async_trait]
impl ResourceStore for MockResourceStore {
    async fn get_resources_in_range(&self, range: &DateRange) -> Result<Vec<Resource>, CollaboratorError> {
        let resources = self.fetch().await?;
        Ok(resources.into_iter().filter(|r| r.may_intersect(range)).collect())
    }

    async fn get_resources_with_alarms(&self) -> Result<Vec<Resource>, CollaboratorError> {
        self.fetch().await
    }

    fn add_listener(&self, listener: Arc<dyn ResourceChangedListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn ResourceChangedListener>) {
        let target = Arc::as_ptr(listener) as *const ();
        self.listeners.lock().unwrap().retain(|l| Arc::as_ptr(l) as *const () != target);
    }
}


/// A clock that only moves when told to, in a timezone with a fixed offset (UTC unless told otherwise)
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
    offset_seconds: i32,
}

impl FixedClock {
    pub fn at(now: DateTime<Utc>) -> Arc<Self> {
        Self::with_offset(now, 0)
    }

    pub fn with_offset(now: DateTime<Utc>, offset_hours: i32) -> Arc<Self> {
        Arc::new(Self { now: Mutex::new(now), offset_seconds: offset_hours * 3600 })
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now = *now + by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    fn local_offset(&self, _at: DateTime<Utc>) -> FixedOffset {
        FixedOffset::east_opt(self.offset_seconds).unwrap()
    }
}


/// Remembers the wakeup the alarm queue asked for
#[derive(Default)]
pub struct RecordingWakeup {
    scheduled: Mutex<Option<DateTime<Utc>>>,
    calls: AtomicUsize,
}

impl RecordingWakeup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scheduled(&self) -> Option<DateTime<Utc>> {
        *self.scheduled.lock().unwrap()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl WakeupScheduler for RecordingWakeup {
    fn schedule(&self, at: DateTime<Utc>) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.scheduled.lock().unwrap() = Some(at);
    }

    fn cancel(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.scheduled.lock().unwrap() = None;
    }
}


#[derive(Default)]
pub struct CountingWidgets {
    refreshes: AtomicUsize,
}

impl CountingWidgets {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

impl WidgetRefresher for CountingWidgets {
    fn refresh_widgets(&self) {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
    }
}


#[derive(Default)]
pub struct CacheRecorder {
    events: Mutex<Vec<CacheChangedEvent>>,
}

impl CacheRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<CacheChangedEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl CacheChangedListener for CacheRecorder {
    fn cache_changed(&self, event: &CacheChangedEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[derive(Default)]
pub struct AlarmRecorder {
    events: Mutex<Vec<AlarmChangedEvent>>,
}

impl AlarmRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<AlarmChangedEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl AlarmChangedListener for AlarmRecorder {
    fn alarm_changed(&self, event: &AlarmChangedEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}


/// Poll `condition` until it holds, failing the test after a couple of seconds
pub async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if condition().await {
            return;
        }
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}
