//! Retry policy for connection builds.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::{RuntimeError, RuntimeResult};

/// Maximum retries after the first failed attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay between attempts (exponential backoff).
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;

/// Maximum delay between attempts.
pub const DEFAULT_MAX_DELAY_MS: u64 = 10_000;

/// Exponential backoff: `min(base * 2^attempt, max)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Delay ceiling.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    /// Never retry.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(16);
        Duration::from_millis(
            self.base_delay_ms
                .saturating_mul(factor)
                .min(self.max_delay_ms),
        )
    }

    /// Whether another attempt is allowed after `attempt` failed with `error`.
    pub fn should_retry(&self, attempt: u32, error: &RuntimeError) -> bool {
        error.is_retryable() && attempt < self.max_retries
    }

    /// Reject policies whose ceiling is below the base delay.
    pub fn validate(&self) -> RuntimeResult<()> {
        if self.max_delay_ms < self.base_delay_ms {
            return Err(RuntimeError::Config(format!(
                "retry max_delay_ms ({}) below base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for(40), Duration::from_secs(10));
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();
        let transient = RuntimeError::transport("ws://x", "refused");
        assert!(policy.should_retry(0, &transient));
        assert!(policy.should_retry(2, &transient));
        assert!(!policy.should_retry(3, &transient));
        assert!(!policy.should_retry(0, &RuntimeError::Config("bad".into())));
        assert!(!RetryPolicy::none().should_retry(0, &transient));
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::default().validate().is_ok());
        let policy = RetryPolicy {
            base_delay_ms: 5_000,
            max_delay_ms: 1_000,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }
}
