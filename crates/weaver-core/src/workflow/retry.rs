//! Retry decisions and backoff delays for step execution.
//!
//! Stateless: every function takes the step's `RetryPolicy` as a parameter.
//! `attempt` is 1-based (the first execution is attempt 1).

use std::time::Duration;

use weaver_types::workflow::{Backoff, FailureKind, RetryPolicy};

/// Stateless retry handler for workflow step failures.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether a step that failed on `attempt` with `kind` runs again.
    ///
    /// Without an explicit `retry_on` list, missing variables and permanent
    /// failures are never retried.
    pub fn should_retry(policy: &RetryPolicy, attempt: u32, kind: FailureKind) -> bool {
        if attempt >= policy.max_attempts {
            return false;
        }
        match &policy.retry_on {
            Some(kinds) => kinds.contains(&kind),
            None => Self::is_retryable_by_default(kind),
        }
    }

    pub fn is_retryable_by_default(kind: FailureKind) -> bool {
        !matches!(kind, FailureKind::MissingVariable | FailureKind::Permanent)
    }

    /// Delay before the attempt that follows `attempt`.
    pub fn delay_for(policy: &RetryPolicy, attempt: u32) -> Duration {
        let ms = match &policy.backoff {
            Backoff::Constant { delay_ms } => *delay_ms,
            Backoff::Linear {
                delay_ms,
                max_delay_ms,
            } => cap(delay_ms.saturating_mul(u64::from(attempt.max(1))), *max_delay_ms),
            Backoff::Exponential {
                delay_ms,
                multiplier,
                max_delay_ms,
            } => {
                let shift = attempt.saturating_sub(1).min(20);
                let factor = multiplier.max(1.0).powi(shift as i32);
                let raw = (*delay_ms as f64 * factor).min(u64::MAX as f64) as u64;
                cap(raw, *max_delay_ms)
            }
        };
        Duration::from_millis(ms)
    }
}

fn cap(ms: u64, max: Option<u64>) -> u64 {
    match max {
        Some(max) => ms.min(max),
        None => ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32, backoff: Backoff) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff,
            retry_on: None,
        }
    }

    #[test]
    fn test_should_retry_within_attempts() {
        let p = policy(3, Backoff::default());
        assert!(RetryHandler::should_retry(&p, 1, FailureKind::Execution));
        assert!(RetryHandler::should_retry(&p, 2, FailureKind::Timeout));
        assert!(!RetryHandler::should_retry(&p, 3, FailureKind::Execution));
    }

    #[test]
    fn test_single_attempt_never_retries() {
        let p = RetryPolicy::none();
        assert!(!RetryHandler::should_retry(&p, 1, FailureKind::Transient));
    }

    #[test]
    fn test_default_predicate_skips_permanent_failures() {
        let p = policy(5, Backoff::default());
        assert!(!RetryHandler::should_retry(&p, 1, FailureKind::MissingVariable));
        assert!(!RetryHandler::should_retry(&p, 1, FailureKind::Permanent));
        assert!(RetryHandler::should_retry(&p, 1, FailureKind::Transient));
    }

    #[test]
    fn test_retry_on_overrides_default() {
        let p = RetryPolicy {
            retry_on: Some(vec![FailureKind::Timeout]),
            ..policy(5, Backoff::default())
        };
        assert!(RetryHandler::should_retry(&p, 1, FailureKind::Timeout));
        assert!(!RetryHandler::should_retry(&p, 1, FailureKind::Execution));
    }

    #[test]
    fn test_constant_delay() {
        let p = policy(3, Backoff::Constant { delay_ms: 100 });
        assert_eq!(RetryHandler::delay_for(&p, 1), Duration::from_millis(100));
        assert_eq!(RetryHandler::delay_for(&p, 2), Duration::from_millis(100));
    }

    #[test]
    fn test_linear_delay_with_cap() {
        let p = policy(
            10,
            Backoff::Linear {
                delay_ms: 100,
                max_delay_ms: Some(250),
            },
        );
        assert_eq!(RetryHandler::delay_for(&p, 1), Duration::from_millis(100));
        assert_eq!(RetryHandler::delay_for(&p, 2), Duration::from_millis(200));
        assert_eq!(RetryHandler::delay_for(&p, 3), Duration::from_millis(250));
    }

    #[test]
    fn test_exponential_delay() {
        let p = policy(
            10,
            Backoff::Exponential {
                delay_ms: 100,
                multiplier: 2.0,
                max_delay_ms: Some(1000),
            },
        );
        assert_eq!(RetryHandler::delay_for(&p, 1), Duration::from_millis(100));
        assert_eq!(RetryHandler::delay_for(&p, 2), Duration::from_millis(200));
        assert_eq!(RetryHandler::delay_for(&p, 3), Duration::from_millis(400));
        assert_eq!(RetryHandler::delay_for(&p, 5), Duration::from_millis(1000));
    }

    #[test]
    fn test_exponential_delay_does_not_overflow() {
        let p = policy(
            u32::MAX,
            Backoff::Exponential {
                delay_ms: u64::MAX / 2,
                multiplier: 10.0,
                max_delay_ms: None,
            },
        );
        assert_eq!(RetryHandler::delay_for(&p, 1000), Duration::from_millis(u64::MAX));
    }
}
