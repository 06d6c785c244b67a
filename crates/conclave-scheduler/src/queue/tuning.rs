//! Adaptive tuning of the admission loop period.
//!
//! Pure functions only; the manager feeds them its running statistics.

use std::time::Duration;

/// Smoothing factor for the wait-time moving average.
pub const WAIT_EMA_ALPHA: f64 = 0.1;

/// Folds a new sample into an exponential moving average.
///
/// The first sample seeds the average.
#[must_use]
pub fn ema(previous: Option<f64>, sample: f64, alpha: f64) -> f64 {
    match previous {
        Some(prev) => alpha.mul_add(sample, (1.0 - alpha) * prev),
        None => sample,
    }
}

/// Bounds and thresholds for interval tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuningPolicy {
    /// Fastest allowed period.
    pub min_interval: Duration,
    /// Slowest allowed period.
    pub max_interval: Duration,
    /// Average wait above which the loop speeds up.
    pub high_wait: Duration,
    /// Multiplier applied when speeding up (< 1).
    pub speedup: f64,
    /// Multiplier applied when idle (> 1).
    pub slowdown: f64,
}

impl Default for TuningPolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(500),
            max_interval: Duration::from_millis(2000),
            high_wait: Duration::from_secs(30),
            speedup: 0.8,
            slowdown: 1.2,
        }
    }
}

/// Computes the next admission loop period.
///
/// High average wait shrinks the period toward `min_interval`; an empty queue
/// with nothing running grows it toward `max_interval`; anything else holds
/// the current period (clamped into bounds).
#[must_use]
pub fn next_interval(
    current: Duration,
    avg_wait_secs: f64,
    waiting: usize,
    active: usize,
    policy: &TuningPolicy,
) -> Duration {
    let proposed = if avg_wait_secs > policy.high_wait.as_secs_f64() && waiting > 0 {
        current.mul_f64(policy.speedup)
    } else if waiting == 0 && active == 0 {
        current.mul_f64(policy.slowdown)
    } else {
        current
    };
    proposed.clamp(policy.min_interval, policy.max_interval)
}
