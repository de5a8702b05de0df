//! End-to-end tests for the engine: submit, execute, retry, finalize.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::TimeZone;
use serde_json::json;
use taskq::clock::{Clock, ManualClock};
use taskq::config::EngineConfig;
use taskq::engine::{AutoscaleConfig, Engine};
use taskq::error::Error;
use taskq::event::{Event, EventKind};
use taskq::handler::{
    FnHandler, HandlerContext, HandlerError, HandlerOptions, HandlerRegistry, HandlerResult,
};
use taskq::model::*;
use taskq::retry::RetryPolicy;
use taskq::storage::{Broker, FailUpdate, MemoryStore, SqliteStore};
use tokio::sync::broadcast;

fn fast_config() -> EngineConfig {
    EngineConfig {
        workers: 2,
        poll_idle_ms: 5,
        reaper_interval_ms: 50,
        scheduler_tick_ms: 50,
        retry: RetryPolicy::new(Duration::from_millis(20), Duration::from_secs(1)).without_jitter(),
        ..EngineConfig::default()
    }
}

/// Collect events until `done` matches one, or fail after five seconds.
async fn wait_for(
    rx: &mut broadcast::Receiver<Event>,
    mut done: impl FnMut(&EventKind) -> bool,
) -> Vec<EventKind> {
    let mut seen = Vec::new();
    let deadline = tokio::time::sleep(Duration::from_secs(5));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => panic!("timed out waiting for event; saw {seen:#?}"),
            event = rx.recv() => {
                let kind = event.expect("event stream closed").kind;
                let finished = done(&kind);
                seen.push(kind);
                if finished {
                    return seen;
                }
            }
        }
    }
}

fn is_terminal_for(id: WorkId) -> impl Fn(&EventKind) -> bool {
    move |kind| match kind {
        EventKind::WorkSucceeded { id: got, .. } | EventKind::WorkFailed { id: got, .. } => {
            *got == id
        }
        _ => false,
    }
}

fn retry_delays(events: &[EventKind]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|k| match k {
            EventKind::WorkRetried { delay_ms, .. } => Some(*delay_ms),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Retry lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn always_failing_item_fails_after_exactly_max_attempts() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let mut registry = HandlerRegistry::new();
    registry.register_fn("flaky", move |_ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err(HandlerError::retryable("downstream unavailable")) }
    });

    let engine = Engine::new(Arc::new(MemoryStore::new()), registry, fast_config());
    let mut rx = engine.subscribe();
    let handle = engine.start();

    let id = engine
        .submit(NewWorkItem::new("flaky", Payload::new(json!({}))).max_attempts(3))
        .await
        .unwrap();
    let events = wait_for(&mut rx, is_terminal_for(id)).await;

    let item = engine.get(id).await.unwrap();
    assert_eq!(item.state, State::Failed);
    assert_eq!(item.attempt_count, 3);
    assert!(item.last_error.unwrap().contains("downstream unavailable"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let delays = retry_delays(&events);
    assert_eq!(delays, vec![20, 40]);
    assert!(delays.windows(2).all(|w| w[0] < w[1]));

    handle.shutdown();
    handle.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn item_failing_twice_then_succeeding_ends_succeeded() {
    let mut registry = HandlerRegistry::new();
    registry.register_fn("third-time", |ctx: HandlerContext| async move {
        if ctx.attempt < 3 {
            Err(HandlerError::retryable(format!("attempt {} failed", ctx.attempt)))
        } else {
            Ok(())
        }
    });

    let engine = Engine::new(Arc::new(MemoryStore::new()), registry, fast_config());
    let mut rx = engine.subscribe();
    let handle = engine.start();

    let id = engine
        .submit(NewWorkItem::new("third-time", Payload::default()).max_attempts(3))
        .await
        .unwrap();
    let events = wait_for(&mut rx, is_terminal_for(id)).await;

    let status = engine.get_status(id).await.unwrap();
    assert_eq!(status.state, State::Succeeded);
    assert_eq!(status.attempt_count, 3);
    assert_eq!(retry_delays(&events).len(), 2);
    assert!(matches!(
        events.last(),
        Some(EventKind::WorkSucceeded { attempt: 3, .. })
    ));

    handle.shutdown();
    handle.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_handler_fails_immediately_without_retries() {
    let engine = Engine::new(
        Arc::new(MemoryStore::new()),
        HandlerRegistry::new(),
        fast_config(),
    );
    let mut rx = engine.subscribe();
    let handle = engine.start();

    let id = engine
        .submit(NewWorkItem::new("nobody-home", Payload::default()).max_attempts(5))
        .await
        .unwrap();
    let events = wait_for(&mut rx, is_terminal_for(id)).await;

    assert!(retry_delays(&events).is_empty());
    let item = engine.get(id).await.unwrap();
    assert_eq!(item.state, State::Failed);
    assert_eq!(item.attempt_count, 0);
    assert!(item.last_error.unwrap().contains("unknown handler"));

    handle.shutdown();
    handle.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn permanent_error_is_not_retried() {
    let mut registry = HandlerRegistry::new();
    registry.register_fn("strict", |ctx: HandlerContext| async move {
        #[derive(serde::Deserialize)]
        #[allow(dead_code)]
        struct Args {
            path: String,
        }
        let _args: Args = ctx.payload.decode(2)?;
        Ok(())
    });

    let engine = Engine::new(Arc::new(MemoryStore::new()), registry, fast_config());
    let mut rx = engine.subscribe();
    let handle = engine.start();

    // Wrong payload version: decoding fails permanently.
    let id = engine
        .submit(NewWorkItem::new("strict", Payload::versioned(1, json!({"path": "/x"}))))
        .await
        .unwrap();
    wait_for(&mut rx, is_terminal_for(id)).await;

    let item = engine.get(id).await.unwrap();
    assert_eq!(item.state, State::Failed);
    assert_eq!(item.attempt_count, 1);

    handle.shutdown();
    handle.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handler_past_its_deadline_times_out() {
    let mut registry = HandlerRegistry::new();
    registry.register_with(
        "slow",
        FnHandler(|_ctx: HandlerContext| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            HandlerResult::Ok(())
        }),
        HandlerOptions::default().timeout(Duration::from_millis(50)),
    );

    let engine = Engine::new(Arc::new(MemoryStore::new()), registry, fast_config());
    let mut rx = engine.subscribe();
    let handle = engine.start();

    let id = engine
        .submit(NewWorkItem::new("slow", Payload::default()).max_attempts(2))
        .await
        .unwrap();
    let events = wait_for(&mut rx, is_terminal_for(id)).await;

    let item = engine.get(id).await.unwrap();
    assert_eq!(item.state, State::Failed);
    assert_eq!(item.attempt_count, 2);
    assert!(item.last_error.unwrap().contains("timed out"));
    assert_eq!(retry_delays(&events).len(), 1);

    handle.shutdown();
    handle.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rate_limited_handler_defers_without_counting() {
    let mut registry = HandlerRegistry::new();
    registry.register_with(
        "metered",
        FnHandler(|_ctx: HandlerContext| async { HandlerResult::Ok(()) }),
        HandlerOptions::default().rate_limit(5.0, 1),
    );

    let engine = Engine::new(Arc::new(MemoryStore::new()), registry, fast_config());
    let mut rx = engine.subscribe();

    let a = engine
        .submit(NewWorkItem::new("metered", Payload::default()))
        .await
        .unwrap();
    let b = engine
        .submit(NewWorkItem::new("metered", Payload::default()))
        .await
        .unwrap();
    let handle = engine.start();

    let mut done = 0;
    let events = wait_for(&mut rx, |k| {
        if matches!(k, EventKind::WorkSucceeded { .. }) {
            done += 1;
        }
        done == 2
    })
    .await;
    assert!(events.iter().any(|k| matches!(k, EventKind::WorkDeferred { .. })));

    for id in [a, b] {
        let item = engine.get(id).await.unwrap();
        assert_eq!(item.state, State::Succeeded);
        assert_eq!(item.attempt_count, 1);
    }

    handle.shutdown();
    handle.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handler_can_extend_its_lease() {
    let extended = Arc::new(AtomicU32::new(0));
    let flag = extended.clone();
    let mut registry = HandlerRegistry::new();
    registry.register_fn("long", move |ctx: HandlerContext| {
        let flag = flag.clone();
        async move {
            ctx.extend_lease(chrono::Duration::minutes(10)).await?;
            flag.store(1, Ordering::SeqCst);
            Ok(())
        }
    });

    let engine = Engine::new(Arc::new(MemoryStore::new()), registry, fast_config());
    let mut rx = engine.subscribe();
    let handle = engine.start();

    let id = engine
        .submit(NewWorkItem::new("long", Payload::default()))
        .await
        .unwrap();
    wait_for(&mut rx, is_terminal_for(id)).await;

    assert_eq!(extended.load(Ordering::SeqCst), 1);
    assert_eq!(engine.get(id).await.unwrap().state, State::Succeeded);

    handle.shutdown();
    handle.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn engine_runs_on_sqlite() {
    let mut registry = HandlerRegistry::new();
    registry.register_fn("echo", |_ctx| async { Ok(()) });

    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let engine = Engine::new(store, registry, fast_config());
    let mut rx = engine.subscribe();
    let handle = engine.start();

    let id = engine
        .submit(NewWorkItem::new("echo", Payload::new(json!({"hello": "world"}))))
        .await
        .unwrap();
    wait_for(&mut rx, is_terminal_for(id)).await;

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.total, 1);

    handle.shutdown();
    handle.join().await;
}

// ---------------------------------------------------------------------------
// Leases under a running engine
// ---------------------------------------------------------------------------

/// Tracks how many executions of a handler overlap.
#[derive(Default)]
struct Overlap {
    current: AtomicU32,
    peak: AtomicU32,
    started: AtomicU32,
}

impl Overlap {
    fn enter(self: &Arc<Self>) -> OverlapGuard {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        OverlapGuard(Arc::clone(self))
    }
}

/// Decrements on drop, so aborted executions are counted out too.
struct OverlapGuard(Arc<Overlap>);

impl Drop for OverlapGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn item_outliving_its_lease_never_runs_twice_at_once() {
    let overlap = Arc::new(Overlap::default());
    let tracker = overlap.clone();
    let mut registry = HandlerRegistry::new();
    registry.register_fn("slow", move |_ctx| {
        let tracker = tracker.clone();
        async move {
            let _running = tracker.enter();
            tokio::time::sleep(Duration::from_millis(800)).await;
            HandlerResult::Ok(())
        }
    });

    let clock = Arc::new(ManualClock::new(
        chrono::Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap(),
    ));
    let config = EngineConfig {
        workers: 2,
        lease_secs: 1,
        reaper_interval_ms: 20,
        ..fast_config()
    };
    let engine = Engine::new(Arc::new(MemoryStore::new()), registry, config)
        .with_clock(clock.clone());
    let mut rx = engine.subscribe();
    let handle = engine.start();

    let id = engine
        .submit(NewWorkItem::new("slow", Payload::default()))
        .await
        .unwrap();
    eventually("the first execution", || overlap.started.load(Ordering::SeqCst) >= 1).await;

    // The lease runs out while the handler is still busy.
    clock.advance(chrono::Duration::seconds(2));

    wait_for(&mut rx, is_terminal_for(id)).await;
    assert_eq!(overlap.peak.load(Ordering::SeqCst), 1);
    let item = engine.get(id).await.unwrap();
    assert_eq!(item.state, State::Succeeded);
    assert_eq!(item.attempt_count, 1);

    handle.shutdown();
    handle.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lease_abandoned_by_a_dead_worker_is_reclaimed() {
    let mut registry = HandlerRegistry::new();
    registry.register_fn("echo", |_ctx| async { Ok(()) });

    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(
        chrono::Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap(),
    ));
    let engine = Engine::new(store.clone(), registry, fast_config()).with_clock(clock.clone());
    let mut rx = engine.subscribe();

    let id = engine
        .submit(NewWorkItem::new("echo", Payload::default()))
        .await
        .unwrap();
    // A worker elsewhere takes the item and then disappears.
    let orphan = store
        .dequeue_batch(1, chrono::Duration::seconds(30), clock.now())
        .await
        .unwrap();
    assert_eq!(orphan.len(), 1);

    let handle = engine.start();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(engine.get(id).await.unwrap().state, State::Leased);

    clock.advance(chrono::Duration::seconds(31));
    let events = wait_for(&mut rx, is_terminal_for(id)).await;
    assert!(events.contains(&EventKind::LeaseReaped { id }));

    let item = engine.get(id).await.unwrap();
    assert_eq!(item.state, State::Succeeded);
    assert_eq!(item.attempt_count, 1);

    handle.shutdown();
    handle.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deep_queue_raises_the_concurrency_ceiling() {
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let overlap = Arc::new(Overlap::default());
    let (gate_in, tracker) = (gate.clone(), overlap.clone());
    let mut registry = HandlerRegistry::new();
    registry.register_fn("gated", move |_ctx| {
        let (gate, tracker) = (gate_in.clone(), tracker.clone());
        async move {
            let _running = tracker.enter();
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| HandlerError::retryable(e.to_string()))?;
            HandlerResult::Ok(())
        }
    });

    let config = EngineConfig {
        workers: 4,
        autoscale: Some(AutoscaleConfig {
            min_workers: 1,
            scale_up_above: 2,
            scale_down_below: 1,
        }),
        ..fast_config()
    };
    let engine = Engine::new(Arc::new(MemoryStore::new()), registry, config);
    assert_eq!(engine.pool_stats().ceiling, 1);

    let mut ids = Vec::new();
    for _ in 0..12 {
        ids.push(
            engine
                .submit(NewWorkItem::new("gated", Payload::default()))
                .await
                .unwrap(),
        );
    }
    let handle = engine.start();

    eventually("every slot busy", || engine.pool_stats().busy == 4).await;
    assert_eq!(engine.pool_stats().ceiling, 4);
    assert_eq!(overlap.peak.load(Ordering::SeqCst), 4);

    gate.add_permits(64);
    eventually("the queue to drain", || {
        overlap.started.load(Ordering::SeqCst) == 12 && engine.pool_stats().busy == 0
    })
    .await;
    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.succeeded, 12);
    assert!(overlap.peak.load(Ordering::SeqCst) <= 4);

    handle.shutdown();
    handle.join().await;
}

// ---------------------------------------------------------------------------
// API surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_then_status_is_pending() {
    let engine = Engine::new(
        Arc::new(MemoryStore::new()),
        HandlerRegistry::new(),
        EngineConfig::default(),
    );
    let id = engine
        .submit(NewWorkItem::new("anything", Payload::default()).priority(Priority::High))
        .await
        .unwrap();

    let status = engine.get_status(id).await.unwrap();
    assert_eq!(status.state, State::Pending);
    assert_eq!(status.attempt_count, 0);
    assert_eq!(status.max_attempts, 3);
    assert!(status.last_error.is_none());

    let err = engine.get_status(WorkId::new()).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn submit_rejects_blank_handler_name() {
    let engine = Engine::new(
        Arc::new(MemoryStore::new()),
        HandlerRegistry::new(),
        EngineConfig::default(),
    );
    let err = engine
        .submit(NewWorkItem::new("  ", Payload::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownHandler(_)));
}

#[tokio::test]
async fn resubmit_creates_a_fresh_item_for_failed_work() {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::new(store.clone(), HandlerRegistry::new(), EngineConfig::default());

    let id = engine
        .submit(
            NewWorkItem::new("importer", Payload::new(json!({"file": "a.csv"})))
                .priority(Priority::Low)
                .max_attempts(4),
        )
        .await
        .unwrap();

    // Still pending: cannot resubmit.
    let err = engine.resubmit(id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { from: State::Pending, .. }));

    let now = chrono::Utc::now();
    let lease = store
        .dequeue_batch(1, chrono::Duration::seconds(30), now)
        .await
        .unwrap()
        .remove(0);
    store
        .fail(
            id,
            lease.token,
            FailUpdate {
                error: "gave up".to_string(),
                count_attempt: true,
            },
            now,
        )
        .await
        .unwrap();

    let new_id = engine.resubmit(id).await.unwrap();
    assert_ne!(new_id, id);
    let fresh = engine.get(new_id).await.unwrap();
    assert_eq!(fresh.state, State::Pending);
    assert_eq!(fresh.attempt_count, 0);
    assert_eq!(fresh.max_attempts, 4);
    assert_eq!(fresh.priority, Priority::Low);
    assert_eq!(fresh.handler_name, "importer");
    assert_eq!(fresh.payload.data, json!({"file": "a.csv"}));
    assert_eq!(fresh.provenance.source, format!("resubmit:{id}"));

    // The original is untouched.
    assert_eq!(engine.get(id).await.unwrap().state, State::Failed);
}

#[tokio::test]
async fn engine_scheduler_uses_engine_clock() {
    let start = chrono::Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(start));
    let engine = Engine::new(
        Arc::new(MemoryStore::new()),
        HandlerRegistry::new(),
        EngineConfig::default(),
    )
    .with_clock(clock.clone());
    let mut rx = engine.subscribe();

    let entry = ScheduleEntry::new(
        "hourly",
        "rollup",
        ScheduleSpec::every(3600),
        Payload::default(),
        start,
    )
    .unwrap();
    engine.register_schedule(entry).await.unwrap();

    clock.advance(chrono::Duration::hours(2));
    let report = engine.scheduler().tick().await.unwrap();
    assert_eq!(report.fired.len(), 2);
    assert_eq!(engine.stats().await.unwrap().pending, 2);

    let first = rx.recv().await.unwrap();
    assert!(matches!(first.kind, EventKind::WorkSubmitted { ref source, .. } if source == "schedule:hourly"));
}

#[tokio::test]
async fn register_schedule_rejects_bad_specs() {
    let engine = Engine::new(
        Arc::new(MemoryStore::new()),
        HandlerRegistry::new(),
        EngineConfig::default(),
    );
    let mut entry = ScheduleEntry::new(
        "x",
        "h",
        ScheduleSpec::every(60),
        Payload::default(),
        chrono::Utc::now(),
    )
    .unwrap();
    entry.spec = ScheduleSpec::cron("not a cron");
    let err = engine.register_schedule(entry.clone()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidSchedule(_)));

    entry.spec = ScheduleSpec::every(u64::MAX);
    let err = engine.register_schedule(entry).await.unwrap_err();
    assert!(matches!(err, Error::InvalidSchedule(_)));
    assert!(engine.list_schedules().await.unwrap().is_empty());
}

#[tokio::test]
async fn pool_stats_reflect_autoscale_floor() {
    let config = EngineConfig {
        workers: 6,
        autoscale: Some(AutoscaleConfig::default()),
        ..EngineConfig::default()
    };
    let engine = Engine::new(Arc::new(MemoryStore::new()), HandlerRegistry::new(), config);
    let stats = engine.pool_stats();
    assert_eq!(stats.slots, 6);
    assert_eq!(stats.ceiling, 2);
    assert_eq!(stats.busy, 0);

    let fixed = Engine::new(
        Arc::new(MemoryStore::new()),
        HandlerRegistry::new(),
        EngineConfig::default(),
    );
    assert_eq!(fixed.pool_stats().ceiling, 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_stops_every_loop() {
    let engine = Engine::new(
        Arc::new(MemoryStore::new()),
        HandlerRegistry::new(),
        fast_config(),
    );
    let handle = engine.start();
    tokio::time::sleep(Duration::from_millis(30)).await;
    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .expect("engine did not stop");
}
