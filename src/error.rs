//! Error types for taskq.

use thiserror::Error;

use crate::model::{State, WorkId};

#[derive(Debug, Error)]
pub enum Error {
    #[error("work item not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: State, to: State },

    /// The caller's lease was reaped or superseded; its report is discarded.
    #[error("lease lost for work item {0}")]
    LeaseLost(WorkId),

    #[error("storage error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("no handler registered for {0:?}")]
    UnknownHandler(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("payload error: {0}")]
    Payload(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the broker/store was unreachable. Callers retry these with
    /// backoff; they never count as a work item failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Store(_) | Error::Migrate(_) | Error::Unavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
