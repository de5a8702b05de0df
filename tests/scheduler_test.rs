//! Integration tests for the recurring scheduler.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use taskq::clock::{Clock, ManualClock};
use taskq::engine::StatusReporter;
use taskq::error::{Error, Result};
use taskq::event::{EventBus, EventKind};
use taskq::model::*;
use taskq::scheduler::{Scheduler, SchedulerConfig};
use taskq::storage::{Broker, Enqueue, MemoryStore, ScheduleStore, SqliteStore};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

fn scheduler_over<S>(store: Arc<S>, clock: Arc<ManualClock>, max_catch_up: u32) -> Scheduler
where
    S: ScheduleStore + Enqueue + 'static,
{
    Scheduler::new(
        store.clone(),
        store,
        StatusReporter::new(Arc::new(EventBus::default())),
        clock,
        SchedulerConfig {
            max_catch_up,
            ..SchedulerConfig::default()
        },
    )
}

fn every_minute(now: DateTime<Utc>) -> ScheduleEntry {
    ScheduleEntry::new(
        "minutely",
        "report",
        ScheduleSpec::every(60),
        Payload::new(json!({"kind": "digest"})),
        now,
    )
    .unwrap()
}

#[tokio::test]
async fn catch_up_after_185_seconds_fires_exactly_three() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    store.upsert_schedule(every_minute(t0())).await.unwrap();
    let scheduler = scheduler_over(store.clone(), clock.clone(), 10);

    clock.advance(Duration::seconds(185));
    let report = scheduler.tick().await.unwrap();
    assert_eq!(report.fired.len(), 3);
    assert_eq!(report.missed, 0);
    assert_eq!(report.skipped, 0);
    assert_eq!(store.stats().await.unwrap().total, 3);

    // A second tick at the same instant emits nothing.
    assert!(scheduler.tick().await.unwrap().fired.is_empty());

    let mut triggers: Vec<String> = Vec::new();
    for id in &report.fired {
        let item = store.get(*id).await.unwrap();
        assert_eq!(item.handler_name, "report");
        assert_eq!(item.provenance.source, "schedule:minutely");
        assert_eq!(item.payload.data, json!({"kind": "digest"}));
        triggers.push(item.provenance.trigger.unwrap());
    }
    triggers.sort();
    let expected: Vec<String> = [60, 120, 180]
        .iter()
        .map(|s| (t0() + Duration::seconds(*s)).to_rfc3339())
        .collect();
    assert_eq!(triggers, expected);
}

#[tokio::test]
async fn delayed_tick_does_not_drift_the_schedule() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    store.upsert_schedule(every_minute(t0())).await.unwrap();
    let scheduler = scheduler_over(store.clone(), clock.clone(), 10);

    clock.advance(Duration::seconds(185));
    scheduler.tick().await.unwrap();

    let entry = store.list_schedules().await.unwrap().remove(0);
    assert_eq!(entry.next_fire_at, t0() + Duration::seconds(240));
    assert_eq!(entry.last_fired_at, Some(t0() + Duration::seconds(185)));
}

#[tokio::test]
async fn stepping_the_clock_fires_once_per_interval() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    store.upsert_schedule(every_minute(t0())).await.unwrap();
    let scheduler = scheduler_over(store.clone(), clock.clone(), 10);

    let mut fired = 0;
    for _ in 0..185 {
        clock.advance(Duration::seconds(1));
        fired += scheduler.tick().await.unwrap().fired.len();
    }
    assert_eq!(fired, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_schedulers_never_double_fire() {
    let memory = Arc::new(MemoryStore::new());
    let sqlite = Arc::new(SqliteStore::in_memory().await.unwrap());

    async fn race<S>(store: Arc<S>) -> u64
    where
        S: ScheduleStore + Enqueue + Broker + 'static,
    {
        let clock = Arc::new(ManualClock::new(t0()));
        store.upsert_schedule(every_minute(t0())).await.unwrap();
        let a = scheduler_over(store.clone(), clock.clone(), 10);
        let b = scheduler_over(store.clone(), clock.clone(), 10);

        for _ in 0..60 {
            let now = clock.advance(Duration::seconds(10));
            let (ra, rb) = tokio::join!(a.tick_at(now), b.tick_at(now));
            ra.unwrap();
            rb.unwrap();
        }
        store.stats().await.unwrap().total
    }

    assert_eq!(race(memory).await, 10);
    assert_eq!(race(sqlite).await, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn schedulers_with_separate_pools_never_double_fire() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("beat.db").display());
    let clock = Arc::new(ManualClock::new(t0()));

    let first = Arc::new(SqliteStore::connect(&url).await.unwrap());
    first.upsert_schedule(every_minute(t0())).await.unwrap();
    let mut schedulers = vec![scheduler_over(first.clone(), clock.clone(), 10)];
    for _ in 0..3 {
        let store = Arc::new(SqliteStore::connect(&url).await.unwrap());
        schedulers.push(scheduler_over(store, clock.clone(), 10));
    }
    let schedulers = Arc::new(schedulers);

    for _ in 0..60 {
        let now = clock.advance(Duration::seconds(10));
        let mut ticks = Vec::new();
        for i in 0..schedulers.len() {
            let schedulers = Arc::clone(&schedulers);
            ticks.push(tokio::spawn(async move { schedulers[i].tick_at(now).await }));
        }
        for tick in ticks {
            tick.await.unwrap().unwrap();
        }
    }

    assert_eq!(first.stats().await.unwrap().total, 10);
    let entry = first.list_schedules().await.unwrap().remove(0);
    assert_eq!(entry.next_fire_at, t0() + Duration::seconds(660));
}

/// Accepts nothing.
struct BrokenQueue;

#[async_trait]
impl Enqueue for BrokenQueue {
    async fn enqueue(&self, _item: WorkItem) -> Result<WorkItem> {
        Err(Error::Unavailable("queue offline".to_string()))
    }
}

#[tokio::test]
async fn failed_enqueue_is_a_misfire_and_the_entry_moves_on() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let events = Arc::new(EventBus::default());
    let mut rx = events.subscribe();
    store.upsert_schedule(every_minute(t0())).await.unwrap();

    let scheduler = Scheduler::new(
        store.clone(),
        Arc::new(BrokenQueue),
        StatusReporter::new(events),
        clock.clone(),
        SchedulerConfig::default(),
    );

    clock.advance(Duration::seconds(125));
    let report = scheduler.tick().await.unwrap();
    assert!(report.fired.is_empty());
    assert_eq!(report.missed, 2);

    // The missed ticks are not retried.
    let entry = store.list_schedules().await.unwrap().remove(0);
    assert_eq!(entry.next_fire_at, t0() + Duration::seconds(180));
    assert!(scheduler.tick().await.unwrap().fired.is_empty());

    let first = rx.recv().await.unwrap();
    match first.kind {
        EventKind::ScheduleMisfired {
            schedule_id,
            instant,
            reason,
        } => {
            assert_eq!(schedule_id, "minutely");
            assert_eq!(instant, t0() + Duration::seconds(60));
            assert!(reason.starts_with("enqueue_failed"), "{reason}");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn catch_up_is_bounded_and_the_rest_skipped() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    store.upsert_schedule(every_minute(t0())).await.unwrap();
    let scheduler = scheduler_over(store.clone(), clock.clone(), 2);

    clock.advance(Duration::seconds(600));
    let report = scheduler.tick().await.unwrap();
    assert_eq!(report.fired.len(), 2);
    assert_eq!(report.skipped, 8);

    let entry = store.list_schedules().await.unwrap().remove(0);
    assert_eq!(entry.next_fire_at, t0() + Duration::seconds(660));
    assert_eq!(store.stats().await.unwrap().total, 2);
}

#[tokio::test]
async fn cron_entries_fire_on_their_instants() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let entry = ScheduleEntry::new(
        "five",
        "sweep",
        ScheduleSpec::cron("*/5 * * * *"),
        Payload::default(),
        t0(),
    )
    .unwrap()
    .priority(Priority::High)
    .max_attempts(7);
    store.upsert_schedule(entry).await.unwrap();
    let scheduler = scheduler_over(store.clone(), clock.clone(), 10);

    clock.advance(Duration::minutes(16));
    let report = scheduler.tick().await.unwrap();
    assert_eq!(report.fired.len(), 3);

    for id in &report.fired {
        let item = store.get(*id).await.unwrap();
        assert_eq!(item.priority, Priority::High);
        assert_eq!(item.max_attempts, 7);
    }
    let entry = store.list_schedules().await.unwrap().remove(0);
    assert_eq!(entry.next_fire_at, t0() + Duration::minutes(20));
}

#[tokio::test]
async fn reregistering_keeps_the_durable_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("beat.db").display());
    let clock = Arc::new(ManualClock::new(t0()));

    {
        let store = Arc::new(SqliteStore::connect(&url).await.unwrap());
        store.upsert_schedule(every_minute(t0())).await.unwrap();
        clock.advance(Duration::seconds(130));
        let fired = scheduler_over(store.clone(), clock.clone(), 10)
            .tick()
            .await
            .unwrap()
            .fired
            .len();
        assert_eq!(fired, 2);
        store.close().await;
    }

    // Restart: the entry is registered again from config, relative to a new now.
    let store = Arc::new(SqliteStore::connect(&url).await.unwrap());
    let stored = store.upsert_schedule(every_minute(clock.now())).await.unwrap();
    assert_eq!(stored.next_fire_at, t0() + Duration::seconds(180));

    let report = scheduler_over(store.clone(), clock.clone(), 10).tick().await.unwrap();
    assert!(report.fired.is_empty());
    assert_eq!(store.stats().await.unwrap().total, 2);
}
