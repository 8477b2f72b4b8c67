//! Bounded, policy-driven in-place retries of a failing test body

use std::collections::HashSet;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::CoordinatorError;

/// Classification of a test body failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Assertion,
    Timeout,
    ElementNotFound,
    Network,
    Resource,
    Script,
    Panic,
    Other,
}

/// The error a test body returns.
///
/// Propagated unchanged to the outcome; retries never wrap it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TestFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TestFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn assertion(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Assertion, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Network, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Other, message)
    }
}

impl From<CoordinatorError> for TestFailure {
    fn from(err: CoordinatorError) -> Self {
        Self::new(FailureKind::Resource, err.to_string())
    }
}

/// Retry configuration attached to one test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RetryPolicyDecl", into = "RetryPolicyDecl")]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Kinds that qualify for a retry. Empty means every kind does.
    pub retryable_kinds: HashSet<FailureKind>,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            retryable_kinds: HashSet::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn retry_on(mut self, kind: FailureKind) -> Self {
        self.retryable_kinds.insert(kind);
        self
    }
}

/// Declared form of a retry policy, as it appears in config and spec files
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RetryPolicyDecl {
    max_retries: u32,
    #[serde(default)]
    retryable_kinds: Vec<FailureKind>,
    #[serde(default)]
    delay_ms: u64,
}

impl From<RetryPolicyDecl> for RetryPolicy {
    fn from(decl: RetryPolicyDecl) -> Self {
        Self {
            max_retries: decl.max_retries,
            retryable_kinds: decl.retryable_kinds.into_iter().collect(),
            delay: Duration::from_millis(decl.delay_ms),
        }
    }
}

impl From<RetryPolicy> for RetryPolicyDecl {
    fn from(policy: RetryPolicy) -> Self {
        let mut kinds: Vec<FailureKind> = policy.retryable_kinds.into_iter().collect();
        kinds.sort_by_key(|k| *k as u8);
        Self {
            max_retries: policy.max_retries,
            retryable_kinds: kinds,
            delay_ms: policy.delay.as_millis() as u64,
        }
    }
}

/// Decide whether a failure of `kind` gets another attempt
pub fn should_retry(kind: FailureKind, attempts_used: u32, policy: &RetryPolicy) -> bool {
    attempts_used < policy.max_retries
        && (policy.retryable_kinds.is_empty() || policy.retryable_kinds.contains(&kind))
}

/// Retry counter for one (test, policy) pair, created at the first failure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    pub attempts_used: u32,
}

/// Result of driving a test body through the coordinator
#[derive(Debug)]
pub struct RetryRun<T> {
    /// The final attempt's result
    pub result: Result<T, TestFailure>,
    /// Total number of body invocations
    pub attempts: u32,
}

/// Re-invokes a failing test body in place.
///
/// Every attempt receives the same `state`, so a retry reuses the resource and
/// context of the attempt before it. Attempts never overlap.
#[derive(Debug, Clone, Default)]
pub struct RetryCoordinator {
    cancel: CancellationToken,
}

impl RetryCoordinator {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Run `body` against `state` under `policy`.
    ///
    /// With no policy the first failure is terminal. A cancelled delay ends the
    /// loop with the failure that triggered it.
    pub async fn run<S, T, B>(
        &self,
        policy: Option<&RetryPolicy>,
        state: &mut S,
        mut body: B,
    ) -> RetryRun<T>
    where
        S: ?Sized,
        B: for<'a> FnMut(&'a mut S) -> BoxFuture<'a, Result<T, TestFailure>>,
    {
        let mut attempts = 0;
        let mut retry_state: Option<RetryState> = None;

        loop {
            attempts += 1;
            let failure = match body(&mut *state).await {
                Ok(value) => {
                    if attempts > 1 {
                        debug!("Passed on attempt {}", attempts);
                    }
                    return RetryRun {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(failure) => failure,
            };

            let Some(policy) = policy else {
                return RetryRun {
                    result: Err(failure),
                    attempts,
                };
            };

            let retry = retry_state.get_or_insert_with(RetryState::default);
            if !should_retry(failure.kind, retry.attempts_used, policy) {
                if retry.attempts_used > 0 {
                    warn!(
                        "Giving up after {} attempt(s): {:?} failure: {}",
                        attempts, failure.kind, failure
                    );
                }
                return RetryRun {
                    result: Err(failure),
                    attempts,
                };
            }

            retry.attempts_used += 1;
            warn!(
                "Attempt {} failed ({:?}): {}; retry {}/{} in {:?}",
                attempts,
                failure.kind,
                failure,
                retry.attempts_used,
                policy.max_retries,
                policy.delay
            );

            if !self.wait(policy.delay).await {
                warn!("Retry wait cancelled; reporting the last failure");
                return RetryRun {
                    result: Err(failure),
                    attempts,
                };
            }
        }
    }

    /// Sleep for `delay`. Returns `false` if cancelled first.
    async fn wait(&self, delay: Duration) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if delay.is_zero() {
            return true;
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::time::Instant;
    use test_case::test_case;

    #[test_case(FailureKind::Timeout, 0, 2, &[] => true ; "empty set retries everything")]
    #[test_case(FailureKind::Timeout, 2, 2, &[] => false ; "budget exhausted")]
    #[test_case(FailureKind::Timeout, 1, 2, &[FailureKind::Timeout] => true ; "listed kind")]
    #[test_case(FailureKind::Assertion, 0, 2, &[FailureKind::Timeout] => false ; "unlisted kind")]
    #[test_case(FailureKind::Other, 0, 0, &[] => false ; "zero retries")]
    fn test_should_retry(kind: FailureKind, used: u32, max: u32, kinds: &[FailureKind]) -> bool {
        let mut policy = RetryPolicy::new(max);
        for k in kinds {
            policy = policy.retry_on(*k);
        }
        should_retry(kind, used, &policy)
    }

    #[tokio::test]
    async fn test_no_policy_runs_once() {
        let coordinator = RetryCoordinator::default();
        let mut calls = 0u32;
        let run = coordinator
            .run(None, &mut calls, |calls| {
                async move {
                    *calls += 1;
                    Err::<(), _>(TestFailure::timeout("slow page"))
                }
                .boxed()
            })
            .await;
        assert_eq!(run.attempts, 1);
        assert_eq!(calls, 1);
        assert_eq!(run.result.unwrap_err(), TestFailure::timeout("slow page"));
    }

    #[tokio::test]
    async fn test_permanent_failure_invoked_n_plus_one_times() {
        let coordinator = RetryCoordinator::default();
        let policy = RetryPolicy::new(3);
        let mut calls = 0u32;
        let run = coordinator
            .run(Some(&policy), &mut calls, |calls| {
                async move {
                    *calls += 1;
                    Err::<(), _>(TestFailure::assertion("expected 200, got 500"))
                }
                .boxed()
            })
            .await;
        assert_eq!(run.attempts, 4);
        assert_eq!(calls, 4);
        assert_eq!(run.result.unwrap_err().message, "expected 200, got 500");
    }

    #[tokio::test]
    async fn test_fails_once_then_succeeds() {
        let coordinator = RetryCoordinator::default();
        let policy = RetryPolicy::new(2);
        let mut calls = 0u32;
        let run = coordinator
            .run(Some(&policy), &mut calls, |calls| {
                async move {
                    *calls += 1;
                    if *calls == 1 {
                        Err(TestFailure::timeout("flaky"))
                    } else {
                        Ok(*calls)
                    }
                }
                .boxed()
            })
            .await;
        assert_eq!(run.attempts, 2);
        assert_eq!(run.result.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unlisted_kind_is_terminal() {
        let coordinator = RetryCoordinator::default();
        let policy = RetryPolicy::new(5).retry_on(FailureKind::Timeout);
        let mut calls = 0u32;
        let run = coordinator
            .run(Some(&policy), &mut calls, |calls| {
                async move {
                    *calls += 1;
                    Err::<(), _>(TestFailure::assertion("wrong title"))
                }
                .boxed()
            })
            .await;
        assert_eq!(run.attempts, 1);
        assert_eq!(run.result.unwrap_err().kind, FailureKind::Assertion);
    }

    #[tokio::test]
    async fn test_delay_applied_between_attempts() {
        let coordinator = RetryCoordinator::default();
        let policy = RetryPolicy::new(2).with_delay(Duration::from_millis(20));
        let mut calls = 0u32;
        let start = Instant::now();
        let run = coordinator
            .run(Some(&policy), &mut calls, |calls| {
                async move {
                    *calls += 1;
                    Err::<(), _>(TestFailure::other("boom"))
                }
                .boxed()
            })
            .await;
        assert_eq!(run.attempts, 3);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_cancelled_wait_propagates_original_failure() {
        let cancel = CancellationToken::new();
        let coordinator = RetryCoordinator::new(cancel.clone());
        let policy = RetryPolicy::new(3).with_delay(Duration::from_secs(60));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let mut calls = 0u32;
        let start = Instant::now();
        let run = coordinator
            .run(Some(&policy), &mut calls, |calls| {
                async move {
                    *calls += 1;
                    Err::<(), _>(TestFailure::network("connection reset"))
                }
                .boxed()
            })
            .await;

        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(run.attempts, 1);
        assert_eq!(run.result.unwrap_err(), TestFailure::network("connection reset"));
    }

    #[test]
    fn test_policy_declaration_shape() {
        let policy: RetryPolicy = serde_json::from_str(
            r#"{"max_retries": 2, "retryable_kinds": ["timeout", "element_not_found"],
                "delay_ms": 250}"#,
        )
        .unwrap();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.delay, Duration::from_millis(250));
        assert!(policy.retryable_kinds.contains(&FailureKind::ElementNotFound));

        let minimal: RetryPolicy = serde_json::from_str(r#"{"max_retries": 1}"#).unwrap();
        assert!(minimal.retryable_kinds.is_empty());
        assert_eq!(minimal.delay, Duration::ZERO);
    }
}
