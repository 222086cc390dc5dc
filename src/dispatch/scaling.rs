//! Worker count decisions.
//!
//! Every scaling interval the supervisor compares how long its workers
//! spent sending with the time that passed. Mostly idle workers shrink the
//! pool; busy workers with a filling queue grow it.

use std::time::Duration;

/// Result of one scaling check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDecision {
    Hold,
    Grow,
    Shrink,
}

/// Bounds and thresholds for one target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingPolicy {
    min_workers: usize,
    max_workers: usize,
    /// Above this idle fraction a worker is retired.
    pub idle_high: f64,
    /// Below this idle fraction (and with a filling queue) a worker is added.
    pub idle_low: f64,
    /// Queue occupancy that counts as filling.
    pub occupancy_high: f64,
}

impl ScalingPolicy {
    /// The minimum is raised to 1 and the maximum to the minimum.
    pub fn new(min_workers: usize, max_workers: usize) -> Self {
        let min_workers = min_workers.max(1);
        Self {
            min_workers,
            max_workers: max_workers.max(min_workers),
            idle_high: 0.25,
            idle_low: 0.10,
            occupancy_high: 0.8,
        }
    }

    pub fn min_workers(&self) -> usize {
        self.min_workers
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn decide(&self, workers: usize, idle: f64, occupancy: f64) -> ScalingDecision {
        if workers < self.min_workers {
            return ScalingDecision::Grow;
        }
        if workers > self.max_workers {
            return ScalingDecision::Shrink;
        }
        if idle > self.idle_high && workers > self.min_workers {
            ScalingDecision::Shrink
        } else if idle < self.idle_low
            && occupancy > self.occupancy_high
            && workers < self.max_workers
        {
            ScalingDecision::Grow
        } else {
            ScalingDecision::Hold
        }
    }
}

/// `1 - send_time / elapsed / workers`, clamped to `[0, 1]`.
pub fn idle_fraction(send_time: Duration, elapsed: Duration, workers: usize) -> f64 {
    if workers == 0 || elapsed.is_zero() {
        return 1.0;
    }
    let busy = send_time.as_secs_f64() / elapsed.as_secs_f64() / workers as f64;
    (1.0 - busy).clamp(0.0, 1.0)
}
