//! Tunables for contention and retry behaviour.

use std::time::Duration;

/// How hard a claim tries before giving up on a contended queue.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimPolicy {
    /// Read-then-CAS cycles per claim call. At least 1.
    pub max_attempts: u32,
    /// Upper bound (exclusive) of the random sleep between cycles.
    pub max_jitter: Duration,
}

impl ClaimPolicy {
    /// Random sleep in `[0, max_jitter)`.
    pub fn jitter(&self) -> Duration {
        self.max_jitter.mul_f64(rand::random::<f64>())
    }
}

impl Default for ClaimPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_jitter: Duration::from_millis(250),
        }
    }
}

/// Delay before a failed task becomes claimable again.
///
/// delay = base_delay * multiplier^(retried - 1), capped at `max_delay`.
/// With the default zero base a failed task is immediately eligible.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            multiplier: 2.0,
            max_delay: Duration::from_secs(3600),
        }
    }

    pub fn exponential(base_delay: Duration, multiplier: f64) -> Self {
        Self {
            base_delay,
            multiplier,
            ..Self::immediate()
        }
    }

    /// Delay after the `retried`-th failure (1-indexed).
    pub fn next_delay(&self, retried: i32) -> Duration {
        let exponent = retried.saturating_sub(1).max(0);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::immediate()
    }
}
