//! Load-driven concurrency ceiling.
//!
//! The worker pool always has `slots` execution slots; the ceiling decides
//! how many of them the dispatcher may fill. Deep queues raise it one step
//! at a time; a shallow queue drops it back to the floor.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AutoscaleConfig {
    pub min_workers: usize,
    pub scale_up_above: u64,
    pub scale_down_below: u64,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            scale_up_above: 10,
            scale_down_below: 5,
        }
    }
}

pub struct Scaler {
    config: Option<AutoscaleConfig>,
    slots: usize,
    ceiling: AtomicUsize,
}

impl Scaler {
    pub fn new(slots: usize, config: Option<AutoscaleConfig>) -> Self {
        let slots = slots.max(1);
        let initial = match config {
            Some(c) => c.min_workers.clamp(1, slots),
            None => slots,
        };
        Self {
            config,
            slots,
            ceiling: AtomicUsize::new(initial),
        }
    }

    /// True when the ceiling follows queue depth.
    pub fn is_adaptive(&self) -> bool {
        self.config.is_some()
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling.load(Ordering::Relaxed)
    }

    /// Apply the current pending depth. Returns the new ceiling.
    pub fn observe(&self, pending: u64) -> usize {
        let Some(config) = self.config else {
            return self.slots;
        };
        let floor = config.min_workers.clamp(1, self.slots);
        let current = self.ceiling();
        let next = if pending > config.scale_up_above {
            (current + 1).min(self.slots)
        } else if pending < config.scale_down_below {
            floor
        } else {
            current
        };
        if next != current {
            self.ceiling.store(next, Ordering::Relaxed);
            tracing::info!(from = current, to = next, pending, "concurrency ceiling adjusted");
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_without_autoscale() {
        let s = Scaler::new(8, None);
        assert_eq!(s.ceiling(), 8);
        assert_eq!(s.observe(1000), 8);
        assert_eq!(s.observe(0), 8);
    }

    #[test]
    fn steps_up_under_load_and_drops_to_floor() {
        let s = Scaler::new(4, Some(AutoscaleConfig::default()));
        assert_eq!(s.ceiling(), 2);
        assert_eq!(s.observe(11), 3);
        assert_eq!(s.observe(11), 4);
        assert_eq!(s.observe(50), 4);
        assert_eq!(s.observe(7), 4);
        assert_eq!(s.observe(4), 2);
    }
}
