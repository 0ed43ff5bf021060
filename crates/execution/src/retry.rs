//! Bounded retry with error-signature classification.
//!
//! Collaborator failures are matched by message against two signature lists:
//! "already gone" signatures turn the failure into an idempotent success, and
//! retryable signatures are retried after a fixed delay while attempts remain.
//! Anything else propagates immediately.

use crate::error::{ExecutionError, ExecutionResult};
use lp_keeper_protocols::{ProtocolError, ProtocolResult};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// How a single failure is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Transient; worth another attempt.
    Retryable,
    /// The target no longer exists; the operation's goal is already met.
    AlreadyGone,
    /// Propagated without retrying.
    Terminal,
}

/// Result of a retried operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    Completed(T),
    /// The target was already absent.
    AlreadyGone,
}

impl<T> RetryOutcome<T> {
    pub fn already_closed(&self) -> bool {
        matches!(self, RetryOutcome::AlreadyGone)
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            RetryOutcome::Completed(value) => Some(value),
            RetryOutcome::AlreadyGone => None,
        }
    }
}

/// Retry parameters for one call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Wait between attempts.
    pub delay: Duration,
    /// Case-insensitive message fragments that mark a failure as transient.
    pub retryable: Vec<String>,
    /// Case-insensitive message fragments that mean "target already gone".
    pub not_found: Vec<String>,
}

fn signatures(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

const TRANSIENT_SIGNATURES: &[&str] = &[
    "network error",
    "rpc error",
    "account info not yet available",
    "timed out",
    "blockhash",
];

const NOT_FOUND_SIGNATURES: &[&str] = &["position not found", "does not exist", "not owned by"];

impl RetryPolicy {
    /// Policy for closing positions: not-found counts as closed.
    #[must_use]
    pub fn close_position() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
            retryable: signatures(TRANSIENT_SIGNATURES),
            not_found: signatures(NOT_FOUND_SIGNATURES),
        }
    }

    /// Policy for residual swaps: slippage failures are retried too.
    #[must_use]
    pub fn swap() -> Self {
        let mut retryable = signatures(TRANSIENT_SIGNATURES);
        retryable.push("slippage tolerance exceeded".to_string());
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
            retryable,
            not_found: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Classifies a failure by its message. Not-found signatures win over
    /// retryable ones.
    pub fn classify(&self, error: &ProtocolError) -> FailureClass {
        let message = error.to_string().to_lowercase();
        let matches = |list: &[String]| list.iter().any(|s| message.contains(&s.to_lowercase()));

        if matches(&self.not_found) {
            FailureClass::AlreadyGone
        } else if matches(&self.retryable) {
            FailureClass::Retryable
        } else {
            FailureClass::Terminal
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::close_position()
    }
}

/// Runs operations under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `operation` until it succeeds, reports the target gone, fails
    /// terminally or runs out of attempts.
    ///
    /// # Errors
    /// [`ExecutionError::Protocol`] for terminal failures and
    /// [`ExecutionError::RetryExhausted`] when every attempt failed transiently.
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> ExecutionResult<RetryOutcome<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProtocolResult<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match operation().await {
                Ok(value) => return Ok(RetryOutcome::Completed(value)),
                Err(error) => error,
            };

            match self.policy.classify(&error) {
                FailureClass::AlreadyGone => {
                    debug!(operation = label, error = %error, "Target already gone, treating as success");
                    return Ok(RetryOutcome::AlreadyGone);
                }
                FailureClass::Retryable if attempt < max_attempts => {
                    warn!(
                        operation = label,
                        attempt,
                        max_attempts,
                        error = %error,
                        "Transient failure, retrying"
                    );
                    if !self.policy.delay.is_zero() {
                        tokio::time::sleep(self.policy.delay).await;
                    }
                }
                FailureClass::Retryable => {
                    return Err(ExecutionError::RetryExhausted {
                        attempts: attempt,
                        source: error,
                    });
                }
                FailureClass::Terminal => return Err(ExecutionError::Protocol(error)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn executor(policy: RetryPolicy) -> RetryExecutor {
        RetryExecutor::new(policy.with_delay(Duration::ZERO))
    }

    #[test]
    fn test_classify() {
        let policy = RetryPolicy::close_position();
        assert_eq!(
            policy.classify(&ProtocolError::PositionNotFound("p".into())),
            FailureClass::AlreadyGone
        );
        assert_eq!(
            policy.classify(&ProtocolError::NotOwned("p".into())),
            FailureClass::AlreadyGone
        );
        assert_eq!(
            policy.classify(&ProtocolError::Network("reset".into())),
            FailureClass::Retryable
        );
        assert_eq!(
            policy.classify(&ProtocolError::SlippageExceeded("2%".into())),
            FailureClass::Terminal
        );
        assert_eq!(
            RetryPolicy::swap().classify(&ProtocolError::SlippageExceeded("2%".into())),
            FailureClass::Retryable
        );
    }

    #[tokio::test]
    async fn test_not_found_is_success_without_retry() {
        let calls = AtomicU32::new(0);
        let outcome = executor(RetryPolicy::close_position())
            .run("close", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ProtocolError::PositionNotFound("p-1".into()))
            })
            .await
            .unwrap();

        assert!(outcome.already_closed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let outcome = executor(RetryPolicy::close_position())
            .run("close", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ProtocolError::Rpc("node behind".into()))
                } else {
                    Ok(n)
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome, RetryOutcome::Completed(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries() {
        let calls = AtomicU32::new(0);
        let result = executor(RetryPolicy::swap().with_max_attempts(2))
            .run("swap", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ProtocolError::Network("reset".into()))
            })
            .await;

        assert!(matches!(
            result,
            Err(ExecutionError::RetryExhausted { attempts: 2, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_terminal_error_propagates_immediately() {
        let calls = AtomicU32::new(0);
        let result = executor(RetryPolicy::close_position())
            .run("close", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ProtocolError::Rejected("bad signer".into()))
            })
            .await;

        assert!(matches!(result, Err(ExecutionError::Protocol(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
