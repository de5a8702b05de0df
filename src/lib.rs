//! # taskq
//!
//! Durable background task distribution: a leased work queue with priority
//! lanes, a worker pool with per-handler deadlines and rate limits,
//! exponential retry with jitter, a duplicate-free recurring scheduler, and
//! OpenTelemetry observability.
//!
//! Work items live in a [`storage`] backend (SQLite or in-memory). The
//! [`engine::Engine`] leases them to registered [`handler`]s and records
//! every outcome back to the store.

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod handler;
pub mod model;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod telemetry;

pub use engine::{Engine, EngineHandle, PoolStats};
pub use error::{Error, Result};
pub use handler::{Handler, HandlerContext, HandlerError, HandlerRegistry, HandlerResult};
pub use model::{NewWorkItem, Payload, Priority, ScheduleEntry, ScheduleSpec, State, WorkId};
