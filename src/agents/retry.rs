//! Retry policy.
//!
//! Decides, from a failed step and the node's attempt counter, whether the
//! node goes to `Retrying` (and after how long) or to `Failed`:
//! - permanent and cancelled failures fail immediately
//! - transient failures retry while `attempt < max_attempts`
//! - exhausted budgets fail with `AttemptsExhausted` wrapping the last error

use std::time::Duration;

use crate::config::EngineConfig;
use crate::provider::backoff_delay;
use crate::task::NodeFailure;

use super::types::StepError;

/// What to do after a failed step.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Try again after `delay`
    Retry { delay: Duration },
    /// Fail the node
    GiveUp(NodeFailure),
}

/// Bounded exponential-backoff retry policy.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.retry_backoff(),
            max_delay: config.max_backoff(),
        }
    }

    /// Whether a node at `attempt` may take another attempt.
    pub fn has_budget(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Decide what happens after `error` on `attempt` (1-based).
    pub fn decide(&self, attempt: u32, error: &StepError) -> RetryDecision {
        if !error.retryable {
            return RetryDecision::GiveUp(error.failure.clone());
        }
        if !self.has_budget(attempt) {
            return RetryDecision::GiveUp(self.exhausted(attempt, error.failure.clone()));
        }

        let delay = match &error.provider {
            Some(provider) => provider.suggested_delay(self.base_delay, self.max_delay, attempt),
            None => backoff_delay(self.base_delay, self.max_delay, attempt),
        };
        RetryDecision::Retry { delay }
    }

    /// The failure recorded when the attempt budget runs out.
    pub fn exhausted(&self, attempt: u32, last: NodeFailure) -> NodeFailure {
        NodeFailure::AttemptsExhausted {
            attempts: attempt,
            last: Box::new(last),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderFailure;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_transient_retries_with_backoff() {
        let err = StepError::execution(ProviderFailure::timeout("slow"));
        assert_eq!(
            policy(3).decide(1, &err),
            RetryDecision::Retry {
                delay: Duration::from_millis(10)
            }
        );
        assert_eq!(
            policy(3).decide(2, &err),
            RetryDecision::Retry {
                delay: Duration::from_millis(20)
            }
        );
    }

    #[test]
    fn test_permanent_never_retries() {
        let err = StepError::execution(ProviderFailure::unrecoverable("bad key"));
        assert!(matches!(
            policy(5).decide(1, &err),
            RetryDecision::GiveUp(NodeFailure::Execution { transient: false, .. })
        ));
    }

    #[test]
    fn test_cancellation_never_retries() {
        assert_eq!(
            policy(5).decide(1, &StepError::cancelled()),
            RetryDecision::GiveUp(NodeFailure::Cancelled)
        );
    }

    #[test]
    fn test_exhausted_wraps_last_failure() {
        let err = StepError::execution(ProviderFailure::unavailable("503"));
        match policy(2).decide(2, &err) {
            RetryDecision::GiveUp(NodeFailure::AttemptsExhausted { attempts, last }) => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, NodeFailure::Execution { transient: true, .. }));
            }
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[test]
    fn test_retry_after_is_capped() {
        let err = StepError::execution(ProviderFailure::rate_limited(
            "429",
            Some(Duration::from_secs(30)),
        ));
        assert_eq!(
            policy(3).decide(1, &err),
            RetryDecision::Retry {
                delay: Duration::from_millis(50)
            }
        );
    }
}
