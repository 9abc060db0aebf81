// =============================================================================
// RETRY CONFIGURATION
// =============================================================================
//
// A failed execution is retried while its lease has been read fewer than
// `limit + 1` times. The read count is the store's delivery counter, so the
// first delivery is read 1 and a limit of 5 allows six executions in total.
//
// Delays are whole seconds: they are handed to the store as a new visibility
// timeout for the leased item.
// =============================================================================

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest delay (in seconds) a store can represent as a visibility offset.
pub const MAX_DELAY_SECONDS: u64 = 2_147_483_647;

/// Exponential strategies double the delay per attempt, so more than this many
/// retries overflows any useful delay long before `max_delay` caps it.
pub const MAX_EXPONENTIAL_LIMIT: u32 = 50;

/// How a failed execution is rescheduled.
///
/// # Examples
///
/// ```
/// use drover::core::RetryConfig;
/// use std::time::Duration;
///
/// let retry = RetryConfig::default();
/// assert_eq!(retry.limit(), 5);
/// assert_eq!(retry.delay_for_attempt(1), Duration::from_secs(3));
/// assert_eq!(retry.delay_for_attempt(3), Duration::from_secs(12));
///
/// let fixed = RetryConfig::fixed(2, 10);
/// assert_eq!(fixed.delay_for_attempt(2), Duration::from_secs(10));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RetryConfig {
    /// Every retry waits `base_delay` seconds.
    Fixed { limit: u32, base_delay: u64 },
    /// Retry `n` waits `min(base_delay * 2^(n-1), max_delay)` seconds.
    Exponential {
        limit: u32,
        base_delay: u64,
        max_delay: u64,
    },
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::Exponential {
            limit: 5,
            base_delay: 3,
            max_delay: 300,
        }
    }
}

impl RetryConfig {
    /// No retries: the first failure is permanent.
    pub const NONE: Self = Self::Fixed {
        limit: 0,
        base_delay: 1,
    };

    pub fn fixed(limit: u32, base_delay: u64) -> Self {
        Self::Fixed { limit, base_delay }
    }

    pub fn exponential(limit: u32, base_delay: u64, max_delay: u64) -> Self {
        Self::Exponential {
            limit,
            base_delay,
            max_delay,
        }
    }

    /// Number of retries allowed after the first attempt.
    pub fn limit(&self) -> u32 {
        match self {
            Self::Fixed { limit, .. } | Self::Exponential { limit, .. } => *limit,
        }
    }

    pub fn base_delay(&self) -> u64 {
        match self {
            Self::Fixed { base_delay, .. } | Self::Exponential { base_delay, .. } => *base_delay,
        }
    }

    /// Whether an item read `read_count` times may be attempted again.
    ///
    /// `read_count` is 1 on first delivery, so with `limit = 5` reads 1..=5
    /// are retried and read 6 is final.
    pub fn should_retry(&self, read_count: u32) -> bool {
        u64::from(read_count) < u64::from(self.limit()) + 1
    }

    /// Delay before the retry that follows attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let seconds = match *self {
            Self::Fixed { base_delay, .. } => base_delay,
            Self::Exponential {
                base_delay,
                max_delay,
                ..
            } => {
                let exponent = attempt.saturating_sub(1).min(63);
                let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
                base_delay.saturating_mul(factor).min(max_delay)
            }
        };
        Duration::from_secs(seconds)
    }

    /// Checks the configuration before any worker starts with it.
    pub fn validate(&self) -> Result<(), InvalidRetryConfig> {
        let base_delay = self.base_delay();
        if base_delay == 0 {
            return Err(InvalidRetryConfig::new("base_delay must be greater than 0"));
        }
        if base_delay > MAX_DELAY_SECONDS {
            return Err(InvalidRetryConfig::new(format!(
                "base_delay must not exceed {MAX_DELAY_SECONDS} seconds"
            )));
        }
        if let Self::Exponential {
            limit, max_delay, ..
        } = *self
        {
            if max_delay > MAX_DELAY_SECONDS {
                return Err(InvalidRetryConfig::new(format!(
                    "max_delay must not exceed {MAX_DELAY_SECONDS} seconds"
                )));
            }
            if max_delay < base_delay {
                return Err(InvalidRetryConfig::new(
                    "max_delay must be greater than or equal to base_delay",
                ));
            }
            if limit > MAX_EXPONENTIAL_LIMIT {
                return Err(InvalidRetryConfig::new(format!(
                    "limit must not exceed {MAX_EXPONENTIAL_LIMIT} for exponential retries"
                )));
            }
        }
        Ok(())
    }
}

/// A [`RetryConfig`] that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid retry configuration: {reason}")]
pub struct InvalidRetryConfig {
    pub reason: String,
}

impl InvalidRetryConfig {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_exponential_five_retries() {
        let retry = RetryConfig::default();
        assert_eq!(retry, RetryConfig::exponential(5, 3, 300));
        assert!(retry.validate().is_ok());
    }

    #[test]
    fn test_retry_boundary_uses_limit_plus_one() {
        let retry = RetryConfig::default();
        for read in 1..=5 {
            assert!(retry.should_retry(read), "read {read} should retry");
        }
        assert!(!retry.should_retry(6));
        assert!(!RetryConfig::NONE.should_retry(1));
    }

    #[test]
    fn test_exponential_delay_doubles_and_caps() {
        let retry = RetryConfig::exponential(10, 3, 20);
        assert_eq!(retry.delay_for_attempt(1), Duration::from_secs(3));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_secs(6));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_secs(12));
        assert_eq!(retry.delay_for_attempt(4), Duration::from_secs(20));
        assert_eq!(retry.delay_for_attempt(200), Duration::from_secs(20));
    }

    #[test]
    fn test_fixed_delay_is_constant() {
        let retry = RetryConfig::fixed(3, 7);
        assert_eq!(retry.delay_for_attempt(1), Duration::from_secs(7));
        assert_eq!(retry.delay_for_attempt(9), Duration::from_secs(7));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(RetryConfig::fixed(1, 0).validate().is_err());
        assert!(RetryConfig::exponential(3, 10, 5).validate().is_err());
        assert!(RetryConfig::exponential(51, 1, 5).validate().is_err());
        assert!(RetryConfig::fixed(100, MAX_DELAY_SECONDS + 1)
            .validate()
            .is_err());
        assert!(RetryConfig::fixed(100, 1).validate().is_ok());
    }

    #[test]
    fn test_serde_tagged_by_strategy() {
        let json = serde_json::to_value(RetryConfig::fixed(2, 4)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"strategy": "fixed", "limit": 2, "base_delay": 4})
        );
    }
}
