//! Retry policy.
//!
//! Stateless decision function consulted after every failed step attempt.
//! Failure kinds in the non-retryable set terminate immediately; all others
//! are retried until the attempt ceiling with a growing backoff delay.

use std::collections::HashSet;
use std::time::Duration;

use stepline_types::config::{BackoffStrategy, RetryConfig};
use stepline_types::execution::FailureKind;
use stepline_types::workflow::Step;

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-attempt the same step after `delay`.
    Retry { delay: Duration },
    /// Give up; the execution fails.
    Terminate,
}

/// Retry parameters shared by all executions.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: BackoffStrategy,
    base_delay: Duration,
    max_delay: Duration,
    non_retryable: HashSet<FailureKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: config.backoff,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            non_retryable: config.non_retryable.iter().copied().collect(),
        }
    }

    /// Default attempt ceiling per step.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Attempt ceiling for a step, honoring its override.
    pub fn ceiling_for(&self, step: &Step) -> u32 {
        step.max_attempts.unwrap_or(self.max_attempts).max(1)
    }

    pub fn is_retryable(&self, kind: FailureKind) -> bool {
        !self.non_retryable.contains(&kind)
    }

    /// Decide with the default ceiling. `attempts` counts attempts made so
    /// far, including the one that just failed.
    pub fn decide(&self, attempts: u32, kind: FailureKind) -> RetryDecision {
        self.decide_with_ceiling(attempts, kind, self.max_attempts)
    }

    /// Decide for a specific step, honoring its `max_attempts` override.
    pub fn decide_for_step(&self, step: &Step, attempts: u32, kind: FailureKind) -> RetryDecision {
        self.decide_with_ceiling(attempts, kind, self.ceiling_for(step))
    }

    fn decide_with_ceiling(&self, attempts: u32, kind: FailureKind, ceiling: u32) -> RetryDecision {
        if !self.is_retryable(kind) || attempts >= ceiling {
            return RetryDecision::Terminate;
        }
        RetryDecision::Retry {
            delay: self.backoff_delay(attempts),
        }
    }

    /// Delay before the attempt following `attempts` failed ones.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let attempts = attempts.max(1);
        let delay = match self.backoff {
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempts),
            BackoffStrategy::Exponential => {
                let factor = 2u32.checked_pow(attempts - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn policy(backoff: BackoffStrategy) -> RetryPolicy {
        RetryPolicy::from_config(&RetryConfig {
            max_attempts: 3,
            backoff,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            non_retryable: vec![FailureKind::ConfigurationError],
        })
    }

    #[test]
    fn test_transient_failures_retry_until_ceiling() {
        let p = policy(BackoffStrategy::Exponential);
        assert!(matches!(p.decide(1, FailureKind::Timeout), RetryDecision::Retry { .. }));
        assert!(matches!(p.decide(2, FailureKind::Unavailable), RetryDecision::Retry { .. }));
        assert_eq!(p.decide(3, FailureKind::Timeout), RetryDecision::Terminate);
        assert_eq!(p.decide(4, FailureKind::Timeout), RetryDecision::Terminate);
    }

    #[test]
    fn test_configuration_error_never_retried() {
        let p = policy(BackoffStrategy::Exponential);
        assert_eq!(p.decide(1, FailureKind::ConfigurationError), RetryDecision::Terminate);
    }

    #[test]
    fn test_invalid_response_retried_by_default() {
        let p = RetryPolicy::default();
        assert!(matches!(
            p.decide(1, FailureKind::InvalidResponse),
            RetryDecision::Retry { .. }
        ));
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let p = policy(BackoffStrategy::Exponential);
        assert_eq!(p.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(p.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(p.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(p.backoff_delay(5), Duration::from_millis(1_000));
        assert_eq!(p.backoff_delay(64), Duration::from_millis(1_000));
    }

    #[test]
    fn test_linear_backoff() {
        let p = policy(BackoffStrategy::Linear);
        assert_eq!(p.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(p.backoff_delay(3), Duration::from_millis(300));
        assert_eq!(p.backoff_delay(20), Duration::from_millis(1_000));
    }

    #[test]
    fn test_step_override_raises_ceiling() {
        let p = policy(BackoffStrategy::Linear);
        let step = Step {
            id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            name: "flaky".to_string(),
            task_type: "noop".into(),
            position: 0,
            config: json!({}),
            timeout_secs: None,
            max_attempts: Some(5),
        };
        assert_eq!(p.ceiling_for(&step), 5);
        assert!(matches!(
            p.decide_for_step(&step, 4, FailureKind::Timeout),
            RetryDecision::Retry { .. }
        ));
        assert_eq!(p.decide_for_step(&step, 5, FailureKind::Timeout), RetryDecision::Terminate);
    }
}
