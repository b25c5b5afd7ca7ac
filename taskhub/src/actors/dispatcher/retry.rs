//! Retry-with-backoff policy for dispatched requests

use serde::{Deserialize, Serialize};
use shared_types::ErrorCategory;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    pub retryable_categories: Vec<ErrorCategory>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10_000,
            retryable_categories: vec![
                ErrorCategory::Timeout,
                ErrorCategory::System,
                ErrorCategory::Network,
            ],
        }
    }
}

impl RetryPolicy {
    /// `min(base * multiplier^(attempt - 1), max)` for a 1-indexed attempt
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        if !raw.is_finite() || raw >= self.max_delay_ms as f64 {
            self.max_delay_ms
        } else {
            raw as u64
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.delay_ms(attempt))
    }

    pub fn is_retryable(&self, category: ErrorCategory) -> bool {
        self.retryable_categories.contains(&category)
    }

    /// Whether a failure of `category` after `retries_so_far` retries gets another attempt
    pub fn should_retry(&self, category: ErrorCategory, retries_so_far: u32) -> bool {
        self.is_retryable(category) && retries_so_far < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence_is_capped() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=5).map(|n| policy.delay_ms(n)).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 10_000]);
        assert_eq!(
            policy.delay_for_attempt(2),
            Duration::from_millis(2000)
        );
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_ms(u32::MAX), 10_000);
    }

    #[test]
    fn test_retryable_categories() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(ErrorCategory::Network, 0));
        assert!(policy.should_retry(ErrorCategory::Timeout, 2));
        assert!(!policy.should_retry(ErrorCategory::System, 3));
        assert!(!policy.should_retry(ErrorCategory::Validation, 0));
        assert!(!policy.should_retry(ErrorCategory::Processing, 0));
        assert!(!policy.should_retry(ErrorCategory::Unknown, 0));
    }
}
