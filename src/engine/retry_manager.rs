//! Retry manager: turns attempt outcomes into store transitions.
//!
//! Consumes completions from the worker pool, decides between success,
//! retry and terminal failure, writes the decision through the broker
//! under the attempt's lease token, and reports it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::model::WorkItem;
use crate::retry::RetryPolicy;
use crate::storage::{Broker, FailUpdate, RetryUpdate};
use crate::telemetry::metrics;

use super::reporter::StatusReporter;
use super::worker::{Completion, Outcome, SlotGauge};

/// Store writes that fail transiently are retried this many times before
/// the outcome is dropped and left to lease expiry.
const STORE_ATTEMPTS: u32 = 3;
const STORE_BACKOFF: Duration = Duration::from_millis(100);

/// What the manager decided for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Succeeded,
    Retried { delay: Duration },
    Failed { reason: String },
    Unroutable,
    Released,
    /// The attempt lost its lease; the current holder decides the outcome.
    Abandoned,
}

pub(crate) struct RetryManager {
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    reporter: StatusReporter,
    policy: RetryPolicy,
    gauge: Arc<SlotGauge>,
}

impl RetryManager {
    pub(crate) fn new(
        broker: Arc<dyn Broker>,
        clock: Arc<dyn Clock>,
        reporter: StatusReporter,
        policy: RetryPolicy,
        gauge: Arc<SlotGauge>,
    ) -> Self {
        Self {
            broker,
            clock,
            reporter,
            policy,
            gauge,
        }
    }

    /// Drain completions until every worker slot has hung up.
    pub(crate) async fn run(self, mut completions: mpsc::UnboundedReceiver<Completion>) {
        while let Some(completion) = completions.recv().await {
            let id = completion.lease.id();
            match self.apply(completion).await {
                Ok(decision) => debug!(%id, ?decision, "outcome recorded"),
                Err(Error::LeaseLost(_)) => {
                    warn!(%id, "lease lost before outcome was recorded, result discarded")
                }
                Err(e) => error!(%id, "failed to record outcome: {e}"),
            }
            self.gauge.release();
        }
        debug!("retry manager stopped");
    }

    /// Record one attempt's outcome.
    pub(crate) async fn apply(&self, completion: Completion) -> Result<Decision> {
        let Completion {
            lease,
            outcome,
            duration,
        } = completion;
        let id = lease.id();
        let token = lease.token;
        let item = &lease.item;

        match outcome {
            Outcome::Success => {
                let done = self
                    .with_store_retry("complete", || self.broker.complete(id, token, self.clock.now()))
                    .await?;
                self.reporter.succeeded(&done, duration);
                Ok(Decision::Succeeded)
            }
            Outcome::Cancelled => {
                self.with_store_retry("release", || self.broker.release(id, token, None, self.clock.now()))
                    .await?;
                self.reporter.deferred(id, Duration::ZERO);
                Ok(Decision::Released)
            }
            Outcome::LeaseLost => {
                warn!(%id, handler = %item.handler_name, "attempt abandoned after losing its lease");
                Ok(Decision::Abandoned)
            }
            Outcome::UnknownHandler => {
                let update = FailUpdate {
                    error: format!("unknown handler: {}", item.handler_name),
                    count_attempt: false,
                };
                let failed = self
                    .with_store_retry("fail", || self.broker.fail(id, token, update.clone(), self.clock.now()))
                    .await?;
                self.reporter.unroutable(&failed);
                Ok(Decision::Unroutable)
            }
            Outcome::Timeout(deadline) => {
                self.on_failure(item, token, format!("timed out after {deadline:?}"), true)
                    .await
            }
            Outcome::Failure(e) => self.on_failure(item, token, e.message, e.retryable).await,
        }
    }

    async fn on_failure(
        &self,
        item: &WorkItem,
        token: crate::model::LeaseToken,
        error: String,
        retryable: bool,
    ) -> Result<Decision> {
        let attempts_made = item.attempt_count + 1;

        if retryable && attempts_made < item.max_attempts {
            let previous = item.last_backoff_ms.map(Duration::from_millis);
            let delay = self.policy.next_delay(item.attempt_count, previous);
            let delay_ms = delay.as_millis() as u64;
            let now = self.clock.now();
            let update = RetryUpdate {
                error: error.clone(),
                not_before: now + chrono::Duration::milliseconds(delay_ms as i64),
                backoff_ms: delay_ms,
            };
            let retried = self
                .with_store_retry("retry", || self.broker.retry(item.id, token, update.clone(), now))
                .await?;
            self.reporter.retried(&retried, delay, &error);
            return Ok(Decision::Retried { delay });
        }

        let reason = if retryable {
            format!("exhausted {attempts_made}/{} attempts: {error}", item.max_attempts)
        } else {
            format!("non-retryable failure: {error}")
        };
        let update = FailUpdate {
            error: reason.clone(),
            count_attempt: true,
        };
        let failed = self
            .with_store_retry("fail", || self.broker.fail(item.id, token, update.clone(), self.clock.now()))
            .await?;
        self.reporter.failed(&failed, &reason);
        Ok(Decision::Failed { reason })
    }

    async fn with_store_retry<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            let result = op().await;
            metrics::record_queue_operation(operation, &result);
            match result {
                Err(e) if e.is_transient() && attempt < STORE_ATTEMPTS => {
                    warn!(attempt, "store unavailable while recording outcome: {e}");
                    tokio::time::sleep(STORE_BACKOFF * attempt).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
