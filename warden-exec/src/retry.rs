//! Retry policy for the close cascade.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ErrorClass;

/// Attempt budget and delays between attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts per order type
    pub max_attempts: u32,
    /// Fixed wait after a rate-limit response
    pub rate_limit_cooldown: Duration,
    /// First transient backoff
    pub base_delay: Duration,
    /// Transient backoff cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            rate_limit_cooldown: Duration::from_secs(15),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the `attempt`-th failure (1-based) of
    /// `class`.
    ///
    /// `None` means do not retry this order type: permanent failures abort the
    /// cascade, validation failures move on to the next order type.
    pub fn delay_for(&self, class: ErrorClass, attempt: u32) -> Option<Duration> {
        match class {
            ErrorClass::Permanent | ErrorClass::Validation => None,
            ErrorClass::RateLimited => Some(self.rate_limit_cooldown),
            ErrorClass::Transient | ErrorClass::Unknown => Some(self.backoff(attempt)),
        }
    }

    /// `base × 2^(attempt−1)` capped at `max_delay`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }
}
