mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};

use acal_cache::alarm::{AlarmQueueManager, AlarmRow, AlarmState};
use acal_cache::config::{ALARM_META_FILE, ALARM_TABLE_FILE};
use acal_cache::meta::MetaStore;
use acal_cache::resource::ResourceId;
use acal_cache::traits::AlarmChangedListener;
use acal_cache::{Error, Settings};

use common::*;

fn now() -> DateTime<Utc> {
    date(2024, 3, 1)
}

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.alarm.snooze = Some(Duration::minutes(10));
    settings
}

async fn start(settings: Settings, store: &Arc<MockResourceStore>, wakeup: &Arc<RecordingWakeup>, clock: &Arc<FixedClock>) -> AlarmQueueManager {
    AlarmQueueManager::start(settings, store.clone(), FakeExpander::new(), wakeup.clone(), clock.clone()).await.unwrap()
}

fn alarms_of(queue: &[AlarmRow], resource_id: ResourceId) -> Vec<AlarmRow> {
    queue.iter().filter(|a| a.resource_id() == resource_id).cloned().collect()
}

fn in_state(queue: &[AlarmRow], state: AlarmState) -> Vec<AlarmRow> {
    queue.iter().filter(|a| a.state() == state).cloned().collect()
}


#[tokio::test]
async fn a_single_wakeup_follows_the_next_active_alarm() {
    init_logs();
    let store = MockResourceStore::with_resources(vec![
        daily(1, now() + Duration::days(1), 3),
        resource(2, &[now() + Duration::hours(2)]),
    ]);
    let wakeup = RecordingWakeup::new();
    let clock = FixedClock::at(now());
    let alarms = start(settings(), &store, &wakeup, &clock).await;

    let queue = alarms.queue().await.unwrap();
    assert_eq!(queue.len(), 4);
    assert_eq!(wakeup.scheduled(), Some(now() + Duration::hours(2) - alarm_advance()));
    assert_eq!(alarms.next_alarm().await.unwrap().unwrap().resource_id(), 2);

    let soonest = alarms_of(&queue, 2)[0].id().unwrap();
    alarms.update_alarm_state(soonest, AlarmState::Dismissed).await.unwrap();
    let first_daily = now() + Duration::days(1) - alarm_advance();
    assert_eq!(wakeup.scheduled(), Some(first_daily));

    let daily_ids: Vec<_> = alarms_of(&queue, 1).iter().map(|a| a.id().unwrap()).collect();
    let snoozed = alarms.update_alarm_state(daily_ids[0], AlarmState::Snoozed).await.unwrap();
    assert_eq!(snoozed.time_to_fire(), first_daily + Duration::minutes(10));
    assert_eq!(wakeup.scheduled(), Some(first_daily + Duration::minutes(10)));

    for id in daily_ids {
        alarms.update_alarm_state(id, AlarmState::Dismissed).await.unwrap();
    }
    assert_eq!(wakeup.scheduled(), None);
    assert_eq!(alarms.next_alarm().await.unwrap(), None);

    alarms.close().unwrap();
}

#[tokio::test]
async fn snoozing_always_pushes_the_alarm_further() {
    init_logs();
    let store = MockResourceStore::with_resources(vec![resource(3, &[now() + Duration::minutes(20)])]);
    let wakeup = RecordingWakeup::new();
    let clock = FixedClock::at(now());
    let alarms = start(settings(), &store, &wakeup, &clock).await;

    let id = alarms.queue().await.unwrap()[0].id().unwrap();

    // Overdue by the time the user reacts: the snooze counts from now
    clock.advance(Duration::minutes(30));
    let overdue = alarms.next_overdue().await.unwrap().unwrap();
    assert_eq!(overdue.id(), Some(id));

    let mut last = overdue.time_to_fire();
    for count in 1..=3 {
        let row = alarms.update_alarm_state(id, AlarmState::Snoozed).await.unwrap();
        assert_eq!(row.state(), AlarmState::Snoozed);
        assert_eq!(row.snooze_count(), count);
        assert!(row.time_to_fire() > last);
        last = row.time_to_fire();
    }
    assert_eq!(last, now() + Duration::minutes(30) + Duration::minutes(30));
    assert_eq!(alarms.next_overdue().await.unwrap(), None);

    alarms.update_alarm_state(id, AlarmState::Dismissed).await.unwrap();
    assert!(matches!(
        alarms.update_alarm_state(id, AlarmState::Snoozed).await,
        Err(Error::InvalidTransition { from: AlarmState::Dismissed, to: AlarmState::Snoozed })
    ));
    assert!(matches!(
        alarms.update_alarm_state(id, AlarmState::Pending).await,
        Err(Error::InvalidTransition { .. })
    ));
    assert!(matches!(alarms.update_alarm_state(9999, AlarmState::Dismissed).await, Err(Error::AlarmNotFound(9999))));

    alarms.close().unwrap();
}

#[tokio::test]
async fn a_dismissed_alarm_does_not_come_back_with_its_resource() {
    init_logs();
    let first = now() + Duration::hours(1);
    let store = MockResourceStore::with_resources(vec![daily(42, first, 3)]);
    let wakeup = RecordingWakeup::new();
    let clock = FixedClock::at(now());
    let alarms = start(settings(), &store, &wakeup, &clock).await;

    let recorder = AlarmRecorder::new();
    let listener: Arc<dyn AlarmChangedListener> = recorder.clone();
    alarms.add_listener(listener.clone());

    clock.set(first - alarm_advance() + Duration::seconds(5));
    let fired = alarms.next_overdue().await.unwrap().unwrap();
    assert_eq!(fired.base_time_to_fire(), first - alarm_advance());
    alarms.update_alarm_state(fired.id().unwrap(), AlarmState::Dismissed).await.unwrap();

    // The same resource, synced again without any change
    store.update(daily(42, first, 3));
    let queue = alarms_of(&alarms.queue().await.unwrap(), 42);

    let dismissed = in_state(&queue, AlarmState::Dismissed);
    assert_eq!(dismissed.len(), 1);
    assert_eq!(dismissed[0].base_time_to_fire(), fired.base_time_to_fire());

    let pending = in_state(&queue, AlarmState::Pending);
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|a| a.base_time_to_fire() > fired.base_time_to_fire()));
    assert!(!pending.iter().any(|a| a.same_trigger(&fired)));
    assert_eq!(wakeup.scheduled(), Some(first + Duration::days(1) - alarm_advance()));

    assert!(recorder.events().iter().any(|e| e.changes().iter().any(|c| c.resource_id == 42)));
    alarms.remove_listener(&listener);
    alarms.close().unwrap();
}

#[tokio::test]
async fn dismissing_a_later_alarm_keeps_the_earlier_ones() {
    init_logs();
    let first = now() + Duration::hours(1);
    let store = MockResourceStore::with_resources(vec![daily(42, first, 3)]);
    let wakeup = RecordingWakeup::new();
    let clock = FixedClock::at(now());
    let alarms = start(settings(), &store, &wakeup, &clock).await;

    let last = alarms.queue().await.unwrap()[2].clone();
    alarms.update_alarm_state(last.id().unwrap(), AlarmState::Dismissed).await.unwrap();
    store.update(daily(42, first, 3));

    let queue = alarms.queue().await.unwrap();
    let pending = in_state(&queue, AlarmState::Pending);
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].time_to_fire(), first - alarm_advance());
    assert_eq!(in_state(&queue, AlarmState::Dismissed).len(), 1);
    assert_eq!(wakeup.scheduled(), Some(first - alarm_advance()));
    alarms.close().unwrap();
}

#[tokio::test]
async fn deleting_a_resource_removes_its_active_alarms() {
    init_logs();
    let store = MockResourceStore::with_resources(vec![
        daily(5, now() + Duration::hours(1), 2),
        daily(6, now() + Duration::hours(3), 2),
    ]);
    let wakeup = RecordingWakeup::new();
    let clock = FixedClock::at(now());
    let alarms = start(settings(), &store, &wakeup, &clock).await;

    let queue = alarms.queue().await.unwrap();
    let first = alarms_of(&queue, 5)[0].id().unwrap();
    alarms.update_alarm_state(first, AlarmState::Dismissed).await.unwrap();

    store.delete(5);
    let queue = alarms.queue().await.unwrap();
    let left = alarms_of(&queue, 5);
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].state(), AlarmState::Dismissed);
    assert_eq!(alarms_of(&queue, 6).len(), 2);
    assert_eq!(wakeup.scheduled(), Some(now() + Duration::hours(3) - alarm_advance()));

    alarms.close().unwrap();
}

#[tokio::test]
async fn triggers_past_the_lookahead_are_left_out() {
    init_logs();
    let store = MockResourceStore::with_resources(vec![daily(4, now() + Duration::days(20), 3)]);
    let wakeup = RecordingWakeup::new();
    let clock = FixedClock::at(now());
    let alarms = start(settings(), &store, &wakeup, &clock).await;

    let queue = alarms.queue().await.unwrap();
    assert_eq!(queue.len(), 2);
    assert!(queue.windows(2).all(|pair| pair[0].time_to_fire() <= pair[1].time_to_fire()));
    alarms.close().unwrap();
}

#[tokio::test]
async fn rebuilding_the_queue_starts_over() {
    init_logs();
    let store = MockResourceStore::with_resources(vec![daily(1, now() + Duration::hours(1), 2)]);
    let wakeup = RecordingWakeup::new();
    let clock = FixedClock::at(now());
    let alarms = start(settings(), &store, &wakeup, &clock).await;

    let id = alarms.queue().await.unwrap()[0].id().unwrap();
    alarms.update_alarm_state(id, AlarmState::Dismissed).await.unwrap();
    store.put(daily(1, now() + Duration::hours(1), 3));

    alarms.rebuild_queue().unwrap();
    let handle = &alarms;
    eventually("the queue to be rebuilt", move || async move {
        handle.queue().await.unwrap().len() == 3
    }).await;

    let queue = alarms.queue().await.unwrap();
    assert!(queue.iter().all(|a| a.state() == AlarmState::Pending));
    assert_eq!(wakeup.scheduled(), Some(now() + Duration::hours(1) - alarm_advance()));
    alarms.log_queue().unwrap();
    alarms.close().unwrap();
}

#[tokio::test]
async fn restarts_trust_only_a_cleanly_closed_queue() {
    init_logs();
    let dir = tempfile::tempdir().unwrap();
    let store = MockResourceStore::with_resources(vec![daily(1, now() + Duration::hours(1), 3)]);
    let wakeup = RecordingWakeup::new();
    let clock = FixedClock::at(now());

    let alarms = start(Settings::in_dir(dir.path()), &store, &wakeup, &clock).await;
    let id = alarms.queue().await.unwrap()[0].id().unwrap();
    alarms.update_alarm_state(id, AlarmState::Dismissed).await.unwrap();
    alarms.close().unwrap();
    assert!(dir.path().join(ALARM_TABLE_FILE).exists());

    let meta = MetaStore::new("test", Some(dir.path().join(ALARM_META_FILE)), StdDuration::from_secs(1));
    let state = meta.load().unwrap().unwrap();
    assert!(state.is_clean());
    assert_eq!(state.count, 3);
    assert_eq!(state.window(), None);

    // Clean: the dismissal survives, and the wakeup is registered again
    let wakeup = RecordingWakeup::new();
    let alarms = start(Settings::in_dir(dir.path()), &store, &wakeup, &clock).await;
    let queue = alarms.queue().await.unwrap();
    assert_eq!(in_state(&queue, AlarmState::Dismissed).len(), 1);
    assert_eq!(wakeup.scheduled(), Some(now() + Duration::days(1) + Duration::hours(1) - alarm_advance()));
    alarms.close().unwrap();

    // Dirty: everything is rebuilt from the store before the first request
    let mut state = meta.load().unwrap().unwrap();
    state.closed = 0;
    meta.store(&state).unwrap();
    store.put(daily(1, now() + Duration::hours(1), 2));

    let alarms = start(Settings::in_dir(dir.path()), &store, &wakeup, &clock).await;
    let queue = alarms.queue().await.unwrap();
    assert_eq!(queue.len(), 2);
    assert!(in_state(&queue, AlarmState::Dismissed).is_empty());
    alarms.close().unwrap();
}

#[tokio::test]
async fn a_closed_queue_refuses_requests() {
    init_logs();
    let store = MockResourceStore::new();
    let wakeup = RecordingWakeup::new();
    let clock = FixedClock::at(now());
    let alarms = start(settings(), &store, &wakeup, &clock).await;
    assert_eq!(wakeup.scheduled(), None);
    assert_eq!(store.listener_count(), 1);

    alarms.close().unwrap();
    assert_eq!(store.listener_count(), 0);
    assert!(matches!(alarms.log_queue(), Err(Error::Closed(_))));
    assert!(matches!(alarms.next_alarm().await, Err(Error::Closed(_))));
    assert!(matches!(alarms.close(), Err(Error::Closed(_))));
}
