//! Engine: the public face of the task distribution core.
//!
//! [`Engine`] accepts work, answers status queries and manages schedules.
//! [`Engine::start`] spawns the runtime parts (dispatcher, worker pool,
//! retry manager, reaper and scheduler) and returns a handle that shuts them
//! down.

pub mod dispatcher;
pub mod rate_limit;
pub mod reporter;
pub mod retry_manager;
pub mod scaling;
pub mod worker;

pub use reporter::StatusReporter;
pub use scaling::AutoscaleConfig;
pub use worker::{Completion, Outcome};

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::event::{Event, EventBus};
use crate::handler::HandlerRegistry;
use crate::model::*;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::storage::{Broker, Enqueue, ScheduleStore};
use crate::telemetry::metrics;

use dispatcher::{Dispatcher, Reaper};
use rate_limit::RateLimiters;
use retry_manager::RetryManager;
use scaling::Scaler;
use worker::{InFlight, SlotDeps, SlotGauge, WorkerPool};

/// Worker pool load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Execution slots in the pool.
    pub slots: usize,
    /// How many slots the dispatcher may currently fill.
    pub ceiling: usize,
    /// Slots holding an attempt whose outcome is not yet recorded.
    pub busy: usize,
}

pub struct Engine {
    broker: Arc<dyn Broker>,
    schedules: Arc<dyn ScheduleStore>,
    enqueue: Arc<dyn Enqueue>,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    reporter: StatusReporter,
    scaler: Arc<Scaler>,
    gauge: Arc<SlotGauge>,
}

impl Engine {
    /// The registry is read-only from here on.
    pub fn new<S>(store: Arc<S>, registry: HandlerRegistry, config: EngineConfig) -> Self
    where
        S: Broker + ScheduleStore + 'static,
    {
        let scaler = Arc::new(Scaler::new(config.workers, config.autoscale));
        Self {
            broker: store.clone(),
            schedules: store.clone(),
            enqueue: store,
            registry: Arc::new(registry),
            clock: Arc::new(SystemClock),
            config,
            reporter: StatusReporter::new(Arc::new(EventBus::default())),
            scaler,
            gauge: Arc::new(SlotGauge::default()),
        }
    }

    /// Replace the time source. Tests drive the engine with a `ManualClock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Store a new `Pending` item and return its id.
    pub async fn submit(&self, new: NewWorkItem) -> Result<WorkId> {
        if new.handler_name.trim().is_empty() {
            return Err(Error::UnknownHandler(new.handler_name));
        }
        let item = WorkItem::from_new(new, self.config.default_max_attempts, self.clock.now());
        let stored = self.enqueue.enqueue(item).await;
        metrics::record_queue_operation("enqueue", &stored);
        let item = stored?;
        self.reporter.submitted(&item);
        info!(id = %item.id, handler = %item.handler_name, priority = %item.priority, "work submitted");
        Ok(item.id)
    }

    pub async fn get_status(&self, id: WorkId) -> Result<WorkStatus> {
        Ok(self.broker.get(id).await?.status())
    }

    pub async fn get(&self, id: WorkId) -> Result<WorkItem> {
        self.broker.get(id).await
    }

    /// Add or update a recurring job. An existing entry keeps its cursor.
    pub async fn register_schedule(&self, entry: ScheduleEntry) -> Result<ScheduleEntry> {
        entry.spec.validate()?;
        let stored = self.schedules.upsert_schedule(entry).await?;
        info!(schedule = %stored.id, spec = %stored.spec, next_fire_at = %stored.next_fire_at, "schedule registered");
        Ok(stored)
    }

    pub async fn list_schedules(&self) -> Result<Vec<ScheduleEntry>> {
        self.schedules.list_schedules().await
    }

    pub async fn remove_schedule(&self, id: &str) -> Result<()> {
        self.schedules.remove_schedule(id).await
    }

    /// Run a `Failed` or `Expired` item again as a fresh item.
    pub async fn resubmit(&self, id: WorkId) -> Result<WorkId> {
        let old = self.broker.get(id).await?;
        if !old.state.is_terminal() || old.state == State::Succeeded {
            return Err(Error::InvalidTransition {
                from: old.state,
                to: State::Pending,
            });
        }
        let new = NewWorkItem::new(old.handler_name, old.payload)
            .priority(old.priority)
            .max_attempts(old.max_attempts)
            .source(format!("resubmit:{id}"));
        self.submit(new).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.broker.stats().await
    }

    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            slots: self.config.workers.max(1),
            ceiling: self.scaler.ceiling(),
            busy: self.gauge.busy(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.reporter.events().subscribe()
    }

    /// A scheduler sharing this engine's store, clock and event stream.
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            Arc::clone(&self.schedules),
            Arc::clone(&self.enqueue),
            self.reporter.clone(),
            Arc::clone(&self.clock),
            SchedulerConfig {
                tick: self.config.scheduler_tick(),
                max_catch_up: self.config.max_catch_up,
                default_max_attempts: self.config.default_max_attempts,
            },
        )
    }

    /// Spawn every runtime loop.
    pub fn start(&self) -> EngineHandle {
        let shutdown = CancellationToken::new();
        let running = Arc::new(InFlight::default());
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let pool = WorkerPool::spawn(
            self.config.workers,
            SlotDeps {
                registry: Arc::clone(&self.registry),
                broker: Arc::clone(&self.broker),
                clock: Arc::clone(&self.clock),
                completions: completions_tx,
                shutdown: shutdown.clone(),
                lease_duration: self.config.lease_duration(),
                running: Arc::clone(&running),
            },
        );

        let retry_manager = RetryManager::new(
            Arc::clone(&self.broker),
            Arc::clone(&self.clock),
            self.reporter.clone(),
            self.config.retry,
            Arc::clone(&self.gauge),
        );

        let dispatcher = Dispatcher {
            broker: Arc::clone(&self.broker),
            clock: Arc::clone(&self.clock),
            registry: Arc::clone(&self.registry),
            reporter: self.reporter.clone(),
            limiters: RateLimiters::new(),
            scaler: Arc::clone(&self.scaler),
            gauge: Arc::clone(&self.gauge),
            running,
            batch_size: self.config.batch_size.max(1),
            lease_duration: self.config.lease_duration(),
            poll_idle: self.config.poll_idle(),
        };

        let reaper = Reaper {
            broker: Arc::clone(&self.broker),
            clock: Arc::clone(&self.clock),
            reporter: self.reporter.clone(),
            interval: self.config.reaper_interval(),
        };

        let tasks = vec![
            tokio::spawn(retry_manager.run(completions_rx)),
            tokio::spawn(dispatcher.run(pool, shutdown.clone())),
            tokio::spawn(reaper.run(shutdown.clone())),
            tokio::spawn(self.scheduler().run(shutdown.clone())),
        ];

        info!(
            workers = self.config.workers,
            handlers = self.registry.len(),
            "engine started"
        );
        EngineHandle { shutdown, tasks }
    }
}

/// Running engine loops.
pub struct EngineHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Stop leasing, cancel running handlers and stop every loop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Wait for every loop to finish. Outcomes of attempts already running
    /// are recorded before this returns.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("engine task ended abnormally: {e}");
            }
        }
        info!("engine stopped");
    }
}
