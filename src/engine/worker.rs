//! Worker pool: a fixed set of execution slots.
//!
//! Each slot takes one leased item at a time, looks up its handler, runs it
//! as its own task under the handler's deadline, and sends the outcome back
//! on the completion channel. Handler failures and panics stop at the slot
//! boundary and become outcomes; they never propagate.
//!
//! While an attempt runs, a heartbeat keeps its lease alive. If the lease is
//! lost anyway (reaped after a stall, or superseded), the attempt is
//! cancelled so the item never executes twice at once.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::handler::{HandlerContext, HandlerError, HandlerRegistry};
use crate::model::{Lease, LeaseToken, WorkId};
use crate::storage::Broker;
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_work_span};

/// How one attempt ended.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success,
    Failure(HandlerError),
    /// Ran past the handler's deadline and was cancelled.
    Timeout(Duration),
    /// No handler registered under the item's name. The handler never ran.
    UnknownHandler,
    /// Interrupted by engine shutdown. Not the handler's fault.
    Cancelled,
    /// The lease could not be renewed and the attempt was abandoned. Another
    /// holder owns the item now, so nothing is recorded.
    LeaseLost,
}

/// A finished attempt on its way to the retry manager.
#[derive(Debug)]
pub struct Completion {
    pub lease: Lease,
    pub outcome: Outcome,
    pub duration: Duration,
}

/// Count of occupied slots, shared by the dispatcher (which fills them)
/// and the retry manager (which frees them once an outcome is recorded).
#[derive(Default)]
pub struct SlotGauge {
    busy: AtomicUsize,
    freed: Notify,
}

impl SlotGauge {
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::Acquire)
    }

    pub(crate) fn acquire(&self) {
        self.busy.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self) {
        let _ = self
            .busy
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.freed.notify_waiters();
    }

    /// Resolves the next time a slot is freed.
    pub(crate) async fn wait_freed(&self) {
        self.freed.notified().await
    }
}

/// Items with an attempt executing in this process.
///
/// The dispatcher consults it so a re-leased item is not started again while
/// an abandoned attempt is still winding down.
#[derive(Default)]
pub struct InFlight {
    ids: std::sync::Mutex<HashSet<WorkId>>,
}

impl InFlight {
    pub fn contains(&self, id: WorkId) -> bool {
        self.ids.lock().map(|ids| ids.contains(&id)).unwrap_or(false)
    }

    fn enter(self: &Arc<Self>, id: WorkId) -> InFlightGuard {
        if let Ok(mut ids) = self.ids.lock() {
            ids.insert(id);
        }
        InFlightGuard {
            set: Arc::clone(self),
            id,
        }
    }
}

struct InFlightGuard {
    set: Arc<InFlight>,
    id: WorkId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut ids) = self.set.ids.lock() {
            ids.remove(&self.id);
        }
    }
}

/// Shared pieces every slot needs.
#[derive(Clone)]
pub(crate) struct SlotDeps {
    pub registry: Arc<HandlerRegistry>,
    pub broker: Arc<dyn Broker>,
    pub clock: Arc<dyn Clock>,
    pub completions: mpsc::UnboundedSender<Completion>,
    pub shutdown: CancellationToken,
    pub lease_duration: chrono::Duration,
    pub running: Arc<InFlight>,
}

pub struct WorkerPool {
    tx: mpsc::Sender<Lease>,
    slots: usize,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(slots: usize, deps: SlotDeps) -> Self {
        let slots = slots.max(1);
        let (tx, rx) = mpsc::channel::<Lease>(slots);
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..slots)
            .map(|slot| {
                let rx = Arc::clone(&rx);
                let deps = deps.clone();
                tokio::spawn(run_slot(slot, rx, deps))
            })
            .collect();

        Self { tx, slots, handles }
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Hand a leased item to the next idle slot.
    pub(crate) async fn submit(&self, lease: Lease) -> Result<()> {
        self.tx
            .send(lease)
            .await
            .map_err(|_| Error::Other("worker pool is shut down".to_string()))
    }

    /// Stop accepting work and wait for every slot to drain and exit.
    pub(crate) async fn join(self) {
        drop(self.tx);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("worker slot ended abnormally: {e}");
            }
        }
    }
}

async fn run_slot(slot: usize, rx: Arc<Mutex<mpsc::Receiver<Lease>>>, deps: SlotDeps) {
    debug!(slot, "worker slot started");
    loop {
        // Runs until the pool's sender is dropped, so leases already handed
        // over are still reported after shutdown begins.
        let next = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(lease) = next else {
            break;
        };

        let completion = if deps.shutdown.is_cancelled() {
            Completion {
                lease,
                outcome: Outcome::Cancelled,
                duration: Duration::ZERO,
            }
        } else {
            execute(lease, &deps).await
        };
        if deps.completions.send(completion).is_err() {
            break;
        }
    }
    debug!(slot, "worker slot stopped");
}

/// Run one attempt to an outcome.
pub(crate) async fn execute(lease: Lease, deps: &SlotDeps) -> Completion {
    let item = &lease.item;
    let attempt = item.attempt_count + 1;
    let span = start_work_span(&item.handler_name, &item.id, attempt);
    record_state_transition(&span, "pending", "leased");

    let started = Instant::now();
    let Some(registered) = deps.registry.get(&item.handler_name) else {
        return Completion {
            lease,
            outcome: Outcome::UnknownHandler,
            duration: started.elapsed(),
        };
    };

    let _running = deps.running.enter(item.id);
    let cancel = deps.shutdown.child_token();
    let ctx = HandlerContext::new(
        item.id,
        item.handler_name.clone(),
        attempt,
        item.payload.clone(),
        cancel.clone(),
    )
    .with_lease(Arc::clone(&deps.broker), Arc::clone(&deps.clock), lease.token);

    let handler = Arc::clone(&registered.handler);
    let mut task = tokio::spawn(async move { handler.handle(ctx).await }.instrument(span.clone()));

    let deadline = registered.options.timeout;
    let finished = async {
        match deadline {
            Some(deadline) => tokio::time::timeout(deadline, &mut task).await.ok(),
            None => Some((&mut task).await),
        }
    };
    let ended = tokio::select! {
        joined = finished => match joined {
            Some(joined) => Ended::Joined(joined),
            None => Ended::TimedOut,
        },
        () = keep_lease(item.id, lease.token, deps) => Ended::LeaseLost,
    };

    let outcome = match ended {
        Ended::TimedOut => {
            cancel.cancel();
            task.abort();
            Outcome::Timeout(deadline.unwrap_or_default())
        }
        Ended::LeaseLost => {
            warn!(id = %item.id, attempt, "lease lost mid-attempt, cancelling handler");
            cancel.cancel();
            task.abort();
            // Hold the in-flight mark until the handler has actually stopped.
            if let Err(e) = (&mut task).await {
                debug!(id = %item.id, "abandoned attempt stopped: {e}");
            }
            Outcome::LeaseLost
        }
        Ended::Joined(Ok(Ok(()))) => Outcome::Success,
        Ended::Joined(Ok(Err(_))) if deps.shutdown.is_cancelled() => Outcome::Cancelled,
        Ended::Joined(Ok(Err(e))) => Outcome::Failure(e),
        Ended::Joined(Err(e)) if e.is_panic() => {
            Outcome::Failure(HandlerError::retryable("handler panicked"))
        }
        Ended::Joined(Err(_)) => Outcome::Cancelled,
    };

    let to = match outcome {
        Outcome::Success => "succeeded",
        Outcome::Cancelled | Outcome::LeaseLost => "pending",
        _ => "failed",
    };
    record_state_transition(&span, "leased", to);

    Completion {
        lease,
        outcome,
        duration: started.elapsed(),
    }
}

enum Ended {
    Joined(std::result::Result<crate::handler::HandlerResult, tokio::task::JoinError>),
    TimedOut,
    LeaseLost,
}

/// Renew the lease every third of its duration. Resolves only once the
/// lease is gone; transient store errors are retried on the next beat.
async fn keep_lease(id: WorkId, token: LeaseToken, deps: &SlotDeps) {
    let period = heartbeat_period(deps.lease_duration);
    let mut beat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    beat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        beat.tick().await;
        let renewed = deps
            .broker
            .extend_lease(id, token, deps.lease_duration, deps.clock.now())
            .await;
        metrics::record_queue_operation("extend_lease", &renewed);
        match renewed {
            Ok(expiry) => debug!(%id, %expiry, "lease renewed"),
            Err(Error::LeaseLost(_)) | Err(Error::NotFound(_)) => return,
            Err(e) => warn!(%id, "lease renewal failed: {e}"),
        }
    }
}

fn heartbeat_period(lease: chrono::Duration) -> Duration {
    let lease = lease.to_std().unwrap_or(Duration::from_secs(1));
    (lease / 3).max(Duration::from_millis(10))
}
