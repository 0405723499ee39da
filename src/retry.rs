//! Shared retry policy for the background loops and the inbox guard.
//!
//! Attempts are numbered from 1. The delay before attempt `n + 1` is
//! `base_delay * 2^(n-1)`, so with the defaults (3 retries, 5s base) a row is
//! retried after 5s, 10s, 20s and then parked as terminally failed.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Exponential backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed after the first failure before a row is terminal.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each subsequent one.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// The backoff delay after failed attempt `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        // Cap the exponent so large counters cannot overflow the multiply.
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// When to retry after failed attempt `attempt`, or `None` when the
    /// budget is exhausted and the row is terminal.
    pub fn next_retry_at(&self, attempt: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if attempt >= self.max_retries {
            return None;
        }
        let delay = chrono::Duration::from_std(self.backoff_delay(attempt))
            .unwrap_or_else(|_| chrono::Duration::seconds(i32::MAX as i64));
        Some(now + delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(5));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(10));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(20));
    }

    #[test]
    fn test_next_retry_none_when_budget_exhausted() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        assert!(policy.next_retry_at(1, now).is_some());
        assert!(policy.next_retry_at(2, now).is_some());
        assert!(policy.next_retry_at(3, now).is_none());
        assert!(policy.next_retry_at(4, now).is_none());
    }

    #[test]
    fn test_next_retry_is_in_the_future_by_backoff() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_secs(2),
        };
        let now = Utc::now();
        let at = policy.next_retry_at(3, now).unwrap();
        assert_eq!(at - now, chrono::Duration::seconds(8));
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        let policy = RetryPolicy {
            max_retries: u32::MAX,
            base_delay: Duration::from_secs(5),
        };
        // Exponent is capped; this must not panic.
        let _ = policy.backoff_delay(10_000);
        let _ = policy.next_retry_at(10_000, Utc::now());
    }
}
