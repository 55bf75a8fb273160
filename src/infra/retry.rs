//! Reusable retry policy for operations that contend on the git index lock.
//!
//! One value object carries the attempt budget and the exponential backoff
//! curve; the index mutator and the batch executor are both handed the same
//! policy type instead of duplicating backoff math.

use std::time::Duration;

use thiserror::Error;

/// Attempt budget plus backoff curve for lock-contention retries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of real attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the second attempt; later delays grow geometrically.
    pub base_delay: Duration,
    /// Multiplier applied per retry (2 doubles the delay each time).
    pub growth: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self { max_attempts, base_delay, growth: 2 }
    }

    /// Backoff delay after the given 1-based attempt number.
    ///
    /// Attempt 1 waits `base_delay`, attempt 2 waits `base_delay * growth`,
    /// and so on.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.growth.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            growth: 2,
        }
    }
}

/// A retried operation ran out of attempts; fatal for the call that hit it.
#[derive(Debug, Error)]
#[error("{operation} failed after {attempts} attempts")]
pub struct RetryExhausted {
    pub operation: String,
    pub attempts: u32,
    #[source]
    pub last_error: anyhow::Error,
}

impl RetryExhausted {
    pub fn new(operation: impl Into<String>, attempts: u32, last_error: anyhow::Error) -> Self {
        Self { operation: operation.into(), attempts, last_error }
    }
}
