//! Typed configuration.
//!
//! Environment variables (loaded once at startup, fail fast if required vars
//! are missing) plus an optional TOML engine file. Sensitive values are
//! wrapped in `secrecy::SecretString` to prevent log leaks.

pub mod secrets;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Deserialize;

use crate::engine::scaling::AutoscaleConfig;
use crate::error::{Error, Result};
use crate::model::{Payload, Priority, ScheduleEntry, ScheduleSpec};
use crate::retry::RetryPolicy;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Path of the engine TOML file, if any.
    pub engine_config: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            engine_config: std::env::var("TASKQ_CONFIG").ok().map(PathBuf::from),
        })
    }

    /// The engine file named by `TASKQ_CONFIG`, or defaults.
    pub fn load_engine_config(&self) -> Result<EngineConfig> {
        match &self.engine_config {
            Some(path) => EngineConfig::load(path),
            None => Ok(EngineConfig::default()),
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

/// Engine tuning, read from TOML. Every field has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker pool slots.
    pub workers: usize,
    /// Upper bound on items leased per poll.
    pub batch_size: usize,
    pub lease_secs: u64,
    pub poll_idle_ms: u64,
    pub reaper_interval_ms: u64,
    pub scheduler_tick_ms: u64,
    /// Missed schedule instants fired per entry per tick; the rest are skipped.
    pub max_catch_up: u32,
    /// Applied to items submitted without `max_attempts`.
    pub default_max_attempts: u32,
    pub retry: RetryPolicy,
    pub autoscale: Option<AutoscaleConfig>,
    #[serde(rename = "schedule")]
    pub schedules: Vec<ScheduleDef>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            batch_size: 16,
            lease_secs: 60,
            poll_idle_ms: 250,
            reaper_interval_ms: 5_000,
            scheduler_tick_ms: 1_000,
            max_catch_up: 10,
            default_max_attempts: 3,
            retry: RetryPolicy::default(),
            autoscale: None,
            schedules: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read engine config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("bad engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        if self.lease_secs == 0 {
            return Err(Error::Config("lease_secs must be positive".to_string()));
        }
        if self.default_max_attempts == 0 {
            return Err(Error::Config("default_max_attempts must be at least 1".to_string()));
        }
        if self.max_catch_up == 0 {
            return Err(Error::Config(
                "max_catch_up must be at least 1, or no schedule would ever fire".to_string(),
            ));
        }
        if self.poll_idle_ms == 0 {
            return Err(Error::Config("poll_idle_ms must be positive".to_string()));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(Error::Config(format!(
                "retry base_delay ({:?}) exceeds max_delay ({:?})",
                self.retry.base_delay, self.retry.max_delay
            )));
        }
        if let Some(autoscale) = self.autoscale {
            if autoscale.scale_down_below >= autoscale.scale_up_above {
                return Err(Error::Config(format!(
                    "autoscale scale_down_below ({}) must be below scale_up_above ({})",
                    autoscale.scale_down_below, autoscale.scale_up_above
                )));
            }
        }
        Ok(())
    }

    pub fn lease_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_secs.min(i64::MAX as u64) as i64)
    }

    pub fn poll_idle(&self) -> Duration {
        Duration::from_millis(self.poll_idle_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms.max(1))
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms.max(1))
    }

    /// Build the configured schedule entries with cursors relative to `now`.
    pub fn schedule_entries(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleEntry>> {
        self.schedules.iter().map(|def| def.to_entry(now)).collect()
    }
}

/// One `[[schedule]]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleDef {
    pub id: String,
    pub handler: String,
    #[serde(default)]
    pub every_secs: Option<u64>,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub payload_version: Option<u32>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl ScheduleDef {
    pub fn spec(&self) -> Result<ScheduleSpec> {
        match (self.every_secs, &self.cron) {
            (Some(secs), None) => Ok(ScheduleSpec::every(secs)),
            (None, Some(expr)) => Ok(ScheduleSpec::cron(expr.clone())),
            _ => Err(Error::InvalidSchedule(format!(
                "schedule {:?} needs exactly one of every_secs or cron",
                self.id
            ))),
        }
    }

    pub fn to_entry(&self, now: DateTime<Utc>) -> Result<ScheduleEntry> {
        let payload = Payload::versioned(
            self.payload_version.unwrap_or(1),
            self.payload.clone().unwrap_or(serde_json::Value::Null),
        );
        let mut entry = ScheduleEntry::new(&self.id, &self.handler, self.spec()?, payload, now)?
            .priority(self.priority.unwrap_or_default());
        if let Some(n) = self.max_attempts {
            entry = entry.max_attempts(n);
        }
        Ok(entry)
    }
}
