//! Retry delays for failed reconciliation.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Policy without jitter, for deterministic delays.
    pub fn fixed(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Calculate delay for the given attempt number (0 is the first retry).
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(31) as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let final_delay = if jitter > 0.0 {
            delay + delay * jitter * rand::rng().random_range(-1.0..=1.0)
        } else {
            delay
        };

        Duration::from_millis(final_delay.max(0.0) as u64)
    }
}
