//! Handler registry.
//!
//! A handler is the code that processes one work item. The registry is an
//! explicit object built at startup and handed to the engine, which keeps it
//! behind an `Arc` and never mutates it again.

pub mod command;

pub use command::CommandHandler;

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::model::{LeaseToken, Payload, WorkId};
use crate::storage::Broker;

/// Why an attempt failed, as reported by the handler.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    /// False when retrying can never succeed.
    pub retryable: bool,
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<Error> for HandlerError {
    fn from(e: Error) -> Self {
        match e {
            // A payload that doesn't decode won't decode next time either.
            Error::Payload(_) => HandlerError::permanent(e.to_string()),
            other => HandlerError::retryable(other.to_string()),
        }
    }
}

pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Processes work items for one `handler_name`.
///
/// Handlers must be idempotent: a worker lost after the side effect but
/// before the report causes the attempt to run again.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: HandlerContext) -> HandlerResult;
}

/// Adapter so plain async closures can be registered.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, ctx: HandlerContext) -> HandlerResult {
        (self.0)(ctx).await
    }
}

/// Everything a handler gets for one attempt.
pub struct HandlerContext {
    pub work_id: WorkId,
    pub handler_name: String,
    /// 1-based number of the attempt being executed.
    pub attempt: u32,
    pub payload: Payload,
    cancel: CancellationToken,
    lease: Option<LeaseHandle>,
}

struct LeaseHandle {
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    token: LeaseToken,
}

impl HandlerContext {
    pub fn new(
        work_id: WorkId,
        handler_name: impl Into<String>,
        attempt: u32,
        payload: Payload,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            work_id,
            handler_name: handler_name.into(),
            attempt,
            payload,
            cancel,
            lease: None,
        }
    }

    pub(crate) fn with_lease(
        mut self,
        broker: Arc<dyn Broker>,
        clock: Arc<dyn Clock>,
        token: LeaseToken,
    ) -> Self {
        self.lease = Some(LeaseHandle {
            broker,
            clock,
            token,
        });
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the attempt is cancelled (deadline or shutdown).
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Keep a long-running attempt from being reaped.
    pub async fn extend_lease(&self, by: Duration) -> Result<DateTime<Utc>> {
        let lease = self
            .lease
            .as_ref()
            .ok_or_else(|| Error::Other("attempt has no lease".to_string()))?;
        lease
            .broker
            .extend_lease(self.work_id, lease.token, by, lease.clock.now())
            .await
    }
}

/// Token-bucket limit on how often a handler may start attempts.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RateLimit {
    pub per_second: f64,
    pub burst: u32,
}

/// Per-handler execution settings.
#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    /// Attempts running longer are cancelled and reported as a timeout.
    pub timeout: Option<StdDuration>,
    pub rate_limit: Option<RateLimit>,
}

impl HandlerOptions {
    pub fn timeout(mut self, timeout: StdDuration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn rate_limit(mut self, per_second: f64, burst: u32) -> Self {
        self.rate_limit = Some(RateLimit { per_second, burst });
        self
    }
}

#[derive(Clone)]
pub struct RegisteredHandler {
    pub handler: Arc<dyn Handler>,
    pub options: HandlerOptions,
}

/// Top-level TOML wrapper for one handler file.
#[derive(Debug, Deserialize)]
struct HandlerFile {
    handler: HandlerDef,
}

/// A command handler's definition.
#[derive(Debug, Clone, Deserialize)]
pub struct HandlerDef {
    pub name: String,
    pub command: std::path::PathBuf,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub rate_per_sec: Option<f64>,
    #[serde(default)]
    pub burst: Option<u32>,
}

impl HandlerDef {
    fn options(&self) -> Result<HandlerOptions> {
        if let Some(rate) = self.rate_per_sec {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(Error::Config(format!(
                    "handler {:?}: rate_per_sec must be a positive number, got {rate}",
                    self.name
                )));
            }
        }
        Ok(HandlerOptions {
            timeout: self.timeout_secs.map(StdDuration::from_secs),
            rate_limit: self.rate_per_sec.map(|per_second| RateLimit {
                per_second,
                burst: self.burst.unwrap_or(1).max(1),
            }),
        })
    }
}

/// Registry of handlers, indexed by name.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, RegisteredHandler>,
}

impl HandlerRegistry {
    /// Create an empty registry with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: impl Handler + 'static) -> &mut Self {
        self.register_with(name, handler, HandlerOptions::default())
    }

    pub fn register_with(
        &mut self,
        name: impl Into<String>,
        handler: impl Handler + 'static,
        options: HandlerOptions,
    ) -> &mut Self {
        self.handlers.insert(
            name.into(),
            RegisteredHandler {
                handler: Arc::new(handler),
                options,
            },
        );
        self
    }

    /// Register an async closure.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(name, FnHandler(f))
    }

    /// Load all `.toml` files from a directory as command handlers.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut registry = Self::new();

        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::Config(format!("cannot read handler dir {}: {e}", dir.display()))
        })?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                let content = std::fs::read_to_string(&path)?;
                let file: HandlerFile = toml::from_str(&content).map_err(|e| {
                    Error::Config(format!("bad handler config {}: {e}", path.display()))
                })?;
                let def = file.handler;
                let options = def
                    .options()
                    .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
                registry.register_with(def.name.clone(), CommandHandler::new(def.command), options);
            }
        }

        Ok(registry)
    }

    /// Look up a handler by name.
    pub fn get(&self, name: &str) -> Option<&RegisteredHandler> {
        self.handlers.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
