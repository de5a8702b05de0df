//! Retry delay calculation.
//!
//! `delay = base * 2^attempt_count * jitter`, where jitter is drawn from
//! `[0.5, 1.5)`. The result never drops below the delay used before the
//! previous retry of the same item and never exceeds `max_delay`, so
//! consecutive backoffs are non-decreasing up to the cap.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

/// Exponential backoff with jitter and a cap.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    #[serde(rename = "base_delay_ms", with = "millis")]
    pub base_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before the retry following a failure at `attempt_count`
    /// completed attempts (0 for the first failure).
    pub fn next_delay(&self, attempt_count: u32, previous: Option<Duration>) -> Duration {
        let factor = if self.jitter {
            rand::thread_rng().gen_range(0.5..1.5)
        } else {
            1.0
        };
        self.delay_with_factor(attempt_count, previous, factor)
    }

    /// Deterministic core of [`next_delay`](Self::next_delay).
    pub fn delay_with_factor(
        &self,
        attempt_count: u32,
        previous: Option<Duration>,
        factor: f64,
    ) -> Duration {
        let cap_ms = self.max_delay.as_millis() as f64;
        let exp = 2f64.powi(attempt_count.min(62) as i32);
        let raw_ms = (self.base_delay.as_millis() as f64 * exp * factor).min(cap_ms);
        let raw = Duration::from_millis(raw_ms.max(0.0) as u64);

        let floor = previous.unwrap_or(Duration::ZERO).min(self.max_delay);
        raw.max(floor).min(self.max_delay)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
