//! Beat: turns schedule entries into work items on time.
//!
//! Every tick walks the entries whose `next_fire_at` has passed. Each missed
//! instant is claimed on its own with a compare-and-swap on the entry's
//! cursor, so two schedulers sharing a store never fire the same instant
//! twice. A claimed firing whose enqueue fails is logged as a misfire and
//! not retried; the cursor has already moved.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::engine::reporter::StatusReporter;
use crate::error::{Error, Result};
use crate::model::{interval_step, ScheduleEntry, ScheduleSpec, WorkId, WorkItem};
use crate::storage::{Enqueue, ScheduleStore};

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub tick: Duration,
    /// Missed instants fired per entry per tick.
    pub max_catch_up: u32,
    pub default_max_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            max_catch_up: 10,
            default_max_attempts: 3,
        }
    }
}

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Items enqueued, one per claimed instant.
    pub fired: Vec<WorkId>,
    /// Instants claimed but not enqueued.
    pub missed: usize,
    /// Instants skipped past the catch-up limit.
    pub skipped: u64,
}

pub struct Scheduler {
    schedules: Arc<dyn ScheduleStore>,
    enqueue: Arc<dyn Enqueue>,
    reporter: StatusReporter,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        schedules: Arc<dyn ScheduleStore>,
        enqueue: Arc<dyn Enqueue>,
        reporter: StatusReporter,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            schedules,
            enqueue,
            reporter,
            clock,
            config,
        }
    }

    /// Tick on an interval until shutdown.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(tick_ms = self.config.tick.as_millis() as u64, "scheduler started");
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.tick().await {
                warn!("scheduler tick failed: {e}");
            }
        }
        debug!("scheduler stopped");
    }

    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(self.clock.now()).await
    }

    /// Fire everything due at `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();
        for entry in self.schedules.list_schedules().await? {
            if entry.next_fire_at > now {
                continue;
            }
            if let Err(e) = self.fire_due(&entry, now, &mut report).await {
                warn!(schedule = %entry.id, "schedule entry skipped this tick: {e}");
            }
        }
        Ok(report)
    }

    async fn fire_due(
        &self,
        entry: &ScheduleEntry,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        let mut instant = entry.next_fire_at;
        let mut fired = 0;

        while instant <= now {
            if fired >= self.config.max_catch_up {
                let (next, skipped) = skip_past(&entry.spec, instant, now)?;
                if self.schedules.claim_fire(&entry.id, instant, next, now).await? {
                    report.skipped += skipped;
                    self.reporter.schedule_misfired(
                        &entry.id,
                        instant,
                        "catch_up_limit",
                        &format!("skipped {skipped} missed firings"),
                    );
                }
                break;
            }

            let next = entry.spec.next_after(instant)?;
            if !self.schedules.claim_fire(&entry.id, instant, next, now).await? {
                debug!(schedule = %entry.id, %instant, "firing claimed elsewhere");
                break;
            }

            let item = WorkItem::from_new(
                entry.work_for(instant),
                self.config.default_max_attempts,
                now,
            );
            match self.enqueue.enqueue(item).await {
                Ok(item) => {
                    self.reporter.submitted(&item);
                    self.reporter.schedule_fired(&entry.id, item.id, instant);
                    report.fired.push(item.id);
                }
                Err(e) => {
                    report.missed += 1;
                    self.reporter
                        .schedule_misfired(&entry.id, instant, "enqueue_failed", &e.to_string());
                }
            }

            fired += 1;
            instant = next;
        }
        Ok(())
    }
}

/// First instant after `now` reachable from `from`, and how many instants
/// in `[from, now]` that passes over.
fn skip_past(
    spec: &ScheduleSpec,
    from: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, u64)> {
    if let ScheduleSpec::Interval { secs } = spec {
        if from <= now {
            let step = interval_step(*secs)?.num_seconds();
            let behind = (now - from).num_seconds() / step + 1;
            let next = behind
                .checked_mul(step)
                .and_then(chrono::Duration::try_seconds)
                .and_then(|gap| from.checked_add_signed(gap))
                .ok_or_else(|| Error::InvalidSchedule(format!("{spec} overflows the calendar")))?;
            return Ok((next, behind.unsigned_abs()));
        }
    }

    let mut next = from;
    let mut skipped = 0;
    while next <= now {
        next = spec.next_after(next)?;
        skipped += 1;
    }
    Ok((next, skipped))
}
