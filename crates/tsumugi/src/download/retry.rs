use std::time::Duration;

use serde::Deserialize;

use crate::util::deserialize_millis;

/// Retry behavior shared by every stream of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per segment within one round, the first one included.
    pub max_attempts: u32,
    #[serde(rename = "backoff_base_ms", deserialize_with = "deserialize_millis")]
    pub backoff_base: Duration,
    #[serde(rename = "max_backoff_ms", deserialize_with = "deserialize_millis")]
    pub max_backoff: Duration,
    /// Extra rounds over the segments still missing after the first pass.
    pub max_global_rounds: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_global_rounds: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero based): `backoff_base * 2^attempt`,
    /// clamped to `max_backoff` and never zero.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = 2u32
            .checked_pow(attempt)
            .and_then(|factor| self.backoff_base.checked_mul(factor))
            .unwrap_or(self.max_backoff);
        delay
            .min(self.max_backoff)
            .max(Duration::from_millis(1))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}
