//! Retry Policy
//!
//! Bounded exponential backoff for retryable stream errors. The
//! session engine owns the retry loop; adapters only classify errors
//! (the `retryable` flag on `StreamError`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff configuration for retryable model-stream failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retry attempts after the first failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (0-indexed), clamped to the max.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms = self.base_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(delay_ms.min(self.max_delay_ms as f64) as u64)
    }
}

/// Whether an HTTP status from a model API is worth retrying.
/// 429 and 5xx are transient; everything else is fatal.
pub fn retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_exponential_backoff() {
        let policy = RetryPolicy {
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
            ..Default::default()
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(8000));
    }

    #[test]
    fn delay_clamped_to_max() {
        let policy = RetryPolicy {
            base_delay_ms: 10000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
            ..Default::default()
        };
        // 10000 * 2^2 = 40000 → clamped
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(30000));
    }

    #[test]
    fn status_classification() {
        assert!(retryable_status(429));
        assert!(retryable_status(500));
        assert!(retryable_status(502));
        assert!(retryable_status(503));
        assert!(!retryable_status(400));
        assert!(!retryable_status(401));
        assert!(!retryable_status(404));
    }
}
