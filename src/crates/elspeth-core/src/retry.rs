//! Retry policies with exponential backoff and jitter
//!
//! Every executor wraps its plugin call in a [`RetryConfig`]. A failure is
//! retried only when the plugin explicitly marked it retryable (the
//! `retryable` field on a transform result, or [`PluginError::Retryable`])
//! and attempts remain. Each failed attempt is recorded as a `retried`
//! node state before the next one opens, so the audit trail shows every
//! attempt, not just the last.
//!
//! Delay for attempt `n` (1-indexed): `min(max_delay, base_delay *
//! 2^(n-1))`, with up to ±`jitter` of random variation.
//!
//! [`PluginError::Retryable`]: crate::error::PluginError::Retryable

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first. Must be >= 1.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(default = "default_base_delay", with = "duration_ms")]
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    #[serde(default = "default_max_delay", with = "duration_ms")]
    pub max_delay: Duration,
    /// Maximum random variation applied to each delay.
    #[serde(default, with = "duration_ms")]
    pub jitter: Duration,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_base_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

mod duration_ms {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: Duration::ZERO,
        }
    }
}

impl RetryConfig {
    /// Policy with `max_attempts` and the default backoff curve.
    #[must_use]
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Whether another attempt is allowed after `attempt` (1-indexed)
    /// failed.
    #[must_use]
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Backoff delay after attempt `attempt` (1-indexed) failed.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let scaled = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exponent));
        let capped = scaled.min(self.max_delay);
        if self.jitter.is_zero() {
            return capped;
        }
        use rand::Rng;
        let jitter_ms = self.jitter.as_millis() as i64;
        let offset = rand::thread_rng().gen_range(-jitter_ms..=jitter_ms);
        if offset >= 0 {
            capped + Duration::from_millis(offset as u64)
        } else {
            capped.saturating_sub(Duration::from_millis(offset.unsigned_abs()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_single_attempt() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 1);
        assert!(!config.allows_retry(1));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(35),
            jitter: Duration::ZERO,
        };
        assert_eq!(config.delay_after(1), Duration::from_millis(10));
        assert_eq!(config.delay_after(2), Duration::from_millis(20));
        // 40ms capped to 35ms.
        assert_eq!(config.delay_after(3), Duration::from_millis(35));
        assert_eq!(config.delay_after(4), Duration::from_millis(35));
    }

    #[test]
    fn test_jitter_stays_bounded() {
        let config = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: Duration::from_millis(20),
        };
        for _ in 0..50 {
            let delay = config.delay_after(1);
            assert!(delay >= Duration::from_millis(80), "delay {delay:?}");
            assert!(delay <= Duration::from_millis(120), "delay {delay:?}");
        }
    }

    #[test]
    fn test_allows_retry_respects_budget() {
        let config = RetryConfig::attempts(3);
        assert!(config.allows_retry(1));
        assert!(config.allows_retry(2));
        assert!(!config.allows_retry(3));
    }

    #[test]
    fn test_serde_round_trip() {
        let config = RetryConfig {
            max_attempts: 4,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(800),
            jitter: Duration::from_millis(5),
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: RetryConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
