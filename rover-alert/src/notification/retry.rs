//! Retry policy for failed deliveries.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::events::DEFAULT_MAX_ATTEMPTS;

/// Backoff between delivery attempts.
///
/// The delay grows linearly with the number of attempts already made:
/// `base_delay * attempts`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of delivery attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay unit in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay between attempts in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Whether to spread delays by up to 25% either way.
    #[serde(default)]
    pub use_jitter: bool,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay_ms() -> u64 {
    5_000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

impl RetryPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Delay before the next attempt, given the attempts already made.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(u64::from(attempts.max(1)))
            .min(self.max_delay_ms);

        if self.use_jitter && delay_ms > 0 {
            // +/- 25%
            let factor = 0.75 + 0.5 * rand::random::<f64>();
            Duration::from_millis((delay_ms as f64 * factor) as u64)
        } else {
            Duration::from_millis(delay_ms)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            use_jitter: false,
        }
    }
}
