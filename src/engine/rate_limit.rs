//! Per-handler token buckets.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::handler::RateLimit;

/// Longest deferral a bucket asks for, however slow its refill.
const MAX_WAIT: Duration = Duration::from_secs(3600);

struct Bucket {
    limit: RateLimit,
    tokens: f64,
    refilled_at: Instant,
}

impl Bucket {
    fn new(limit: RateLimit, now: Instant) -> Self {
        Self {
            limit,
            tokens: f64::from(limit.burst.max(1)),
            refilled_at: now,
        }
    }

    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        let capacity = f64::from(self.limit.burst.max(1));
        let elapsed = now.saturating_duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.limit.per_second).min(capacity);
        self.refilled_at = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else if self.limit.per_second.is_nan() || self.limit.per_second <= 0.0 {
            Err(MAX_WAIT)
        } else {
            let secs = (1.0 - self.tokens) / self.limit.per_second;
            Err(Duration::try_from_secs_f64(secs)
                .unwrap_or(MAX_WAIT)
                .min(MAX_WAIT))
        }
    }
}

/// Rate limiters keyed by handler name. Handlers without a limit always pass.
#[derive(Default)]
pub struct RateLimiters {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a token for `handler`, or return how long until one is available.
    pub fn check(&self, handler: &str, limit: Option<RateLimit>) -> Result<(), Duration> {
        self.check_at(handler, limit, Instant::now())
    }

    pub(crate) fn check_at(
        &self,
        handler: &str,
        limit: Option<RateLimit>,
        now: Instant,
    ) -> Result<(), Duration> {
        let Some(limit) = limit else {
            return Ok(());
        };
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets
            .entry(handler.to_string())
            .or_insert_with(|| Bucket::new(limit, now))
            .try_take(now)
    }
}
