//! Exponential reconnect backoff with jitter.

use rand::Rng;
use std::time::Duration;

/// Reconnect delay generator.
///
/// The ideal delay doubles from `base` up to `max`; every returned delay is
/// spread uniformly by `±jitter` around it.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    /// Creates a new Backoff.
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max,
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    /// Delay before the reconnect following failure number `attempt` (0-based), without jitter.
    pub fn ideal_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Returns the next delay and advances.
    pub fn next_delay(&mut self) -> Duration {
        let ideal = self.ideal_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        if self.jitter == 0.0 {
            return ideal;
        }
        let spread = rand::rng().random_range(-self.jitter..=self.jitter);
        ideal.mul_f64(1.0 + spread)
    }

    /// Back to `base` after a stable connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Failures since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
