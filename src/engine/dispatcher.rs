//! Dispatcher: the poll loop that feeds the worker pool, and the reaper
//! loop that recovers abandoned leases.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::handler::HandlerRegistry;
use crate::model::Lease;
use crate::storage::Broker;
use crate::telemetry::metrics;

use super::rate_limit::RateLimiters;
use super::reporter::StatusReporter;
use super::scaling::Scaler;
use super::worker::{InFlight, SlotGauge, WorkerPool};

/// Upper bound on the wait between polls while the store is failing.
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(5);

pub(crate) struct Dispatcher {
    pub broker: Arc<dyn Broker>,
    pub clock: Arc<dyn Clock>,
    pub registry: Arc<HandlerRegistry>,
    pub reporter: StatusReporter,
    pub limiters: RateLimiters,
    pub scaler: Arc<Scaler>,
    pub gauge: Arc<SlotGauge>,
    pub running: Arc<InFlight>,
    pub batch_size: usize,
    pub lease_duration: chrono::Duration,
    pub poll_idle: Duration,
}

impl Dispatcher {
    /// Poll until shutdown, then drain the pool.
    pub(crate) async fn run(self, pool: WorkerPool, shutdown: CancellationToken) {
        info!(slots = pool.slots(), "dispatcher started");
        let mut failures: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let wait = match self.poll_once(&pool).await {
                Ok(0) => {
                    failures = 0;
                    Some(self.poll_idle)
                }
                Ok(_) => {
                    failures = 0;
                    None
                }
                Err(e) if e.is_transient() => {
                    failures = failures.saturating_add(1);
                    let backoff = self
                        .poll_idle
                        .saturating_mul(2u32.saturating_pow(failures.min(16)))
                        .min(MAX_ERROR_BACKOFF);
                    warn!(failures, backoff_ms = backoff.as_millis() as u64, "store unavailable: {e}");
                    Some(backoff)
                }
                Err(e) => {
                    error!("dispatch error: {e}");
                    Some(self.poll_idle)
                }
            };

            if let Some(wait) = wait {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.gauge.wait_freed() => {}
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }

        info!("dispatcher stopping, draining worker pool");
        pool.join().await;
    }

    /// Lease as many items as there is free capacity for and hand them to
    /// the pool. Returns how many were handed over.
    pub(crate) async fn poll_once(&self, pool: &WorkerPool) -> Result<usize> {
        if self.scaler.is_adaptive() {
            match self.broker.stats().await {
                Ok(stats) => {
                    self.scaler.observe(stats.pending);
                }
                Err(e) => debug!("queue depth unavailable: {e}"),
            }
        }

        let capacity = self
            .scaler
            .ceiling()
            .saturating_sub(self.gauge.busy())
            .min(self.batch_size);
        if capacity == 0 {
            return Ok(0);
        }

        let now = self.clock.now();
        let leased = self
            .broker
            .dequeue_batch(capacity, self.lease_duration, now)
            .await;
        metrics::record_queue_operation("dequeue_batch", &leased);
        let leases = leased?;

        let mut dispatched = 0;
        for lease in leases {
            // An abandoned attempt of this item is still stopping here. Hand
            // it straight back; it is picked up again on a later poll.
            if self.running.contains(lease.id()) {
                self.defer(&lease, Duration::ZERO, now).await;
                continue;
            }

            let limit = self
                .registry
                .get(&lease.item.handler_name)
                .and_then(|h| h.options.rate_limit);
            if let Err(wait) = self.limiters.check(&lease.item.handler_name, limit) {
                self.defer(&lease, wait, now).await;
                continue;
            }

            self.reporter.leased(&lease.item);
            self.gauge.acquire();
            let id = lease.id();
            if let Err(e) = pool.submit(lease).await {
                self.gauge.release();
                warn!(%id, "lease not dispatched, left to expire: {e}");
                continue;
            }
            dispatched += 1;
        }

        Ok(dispatched)
    }

    /// Give a lease back without running it. The attempt is not counted.
    async fn defer(&self, lease: &Lease, wait: Duration, now: DateTime<Utc>) {
        let id = lease.id();
        let not_before = now + chrono::Duration::milliseconds(wait.as_millis() as i64);
        let released = self.broker.release(id, lease.token, Some(not_before), now).await;
        metrics::record_queue_operation("release", &released);
        match released {
            Ok(_) => {
                debug!(%id, handler = %lease.item.handler_name, wait_ms = wait.as_millis() as u64, "deferred");
                self.reporter.deferred(id, wait);
            }
            Err(e) => warn!(%id, "failed to defer item: {e}"),
        }
    }
}

/// Periodically returns expired leases to the queue and expires overdue
/// pending items.
pub(crate) struct Reaper {
    pub broker: Arc<dyn Broker>,
    pub clock: Arc<dyn Clock>,
    pub reporter: StatusReporter,
    pub interval: Duration,
}

impl Reaper {
    pub(crate) async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.reap_once().await {
                warn!("reaper pass failed: {e}");
            }
        }
        debug!("reaper stopped");
    }

    pub(crate) async fn reap_once(&self) -> Result<usize> {
        let reaped = self.broker.reap_expired(self.clock.now()).await;
        metrics::record_queue_operation("reap_expired", &reaped);
        let report = reaped?;
        for id in &report.released {
            self.reporter.reaped(*id);
        }
        for id in &report.expired {
            self.reporter.expired(*id);
        }
        Ok(report.released.len() + report.expired.len())
    }
}
