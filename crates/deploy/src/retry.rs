//! Fixed-delay retry executor.
//!
//! Attempts are counted from 1. A policy with `retries = n` invokes the action at
//! most `n` times. The optional predicate sees every failure together with the
//! attempt number that produced it and can stop the loop early.

use std::{
    fmt,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use backon::{ConstantBuilder, Retryable};

use crate::error::DeployError;

/// Decides whether a failed attempt should be retried.
pub type RetryPredicate<E> = Arc<dyn Fn(&E, usize) -> bool + Send + Sync>;

/// Retry configuration for a single call. Stateless and cheap to clone.
pub struct RetryPolicy<E = DeployError> {
    /// Total number of attempts, always at least 1.
    retries: usize,
    delay: Duration,
    is_need_retry: Option<RetryPredicate<E>>,
}

impl<E> RetryPolicy<E> {
    pub fn new(retries: usize, delay: Duration) -> Self {
        Self {
            retries: retries.max(1),
            delay,
            is_need_retry: None,
        }
    }

    pub fn retries(&self) -> usize {
        self.retries
    }

    /// Delay between attempts.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// A single attempt, no retry.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Set the predicate consulted after every failed attempt.
    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&E, usize) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.is_need_retry = Some(Arc::new(predicate));
        self
    }

    fn should_retry(&self, err: &E, attempt: usize) -> bool {
        self.is_need_retry
            .as_ref()
            .is_none_or(|predicate| predicate(err, attempt))
    }
}

impl RetryPolicy<DeployError> {
    /// Retry only transient network failures.
    pub fn transient(retries: usize, delay: Duration) -> Self {
        Self::new(retries, delay).with_predicate(|err: &DeployError, _| err.is_transient())
    }
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            retries: self.retries,
            delay: self.delay,
            is_need_retry: self.is_need_retry.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("retries", &self.retries)
            .field("delay", &self.delay)
            .field("is_need_retry", &self.is_need_retry.is_some())
            .finish()
    }
}

/// Run `action` under `policy`, returning the first success or the last error.
pub async fn run<T, E, F, Fut>(policy: &RetryPolicy<E>, mut action: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let attempt = AtomicUsize::new(0);

    let backoff = ConstantBuilder::default()
        .with_delay(policy.delay)
        .with_max_times(policy.retries.saturating_sub(1));

    (|| {
        attempt.fetch_add(1, Ordering::SeqCst);
        action()
    })
    .retry(backoff)
    .sleep(tokio::time::sleep)
    .when(|err: &E| policy.should_retry(err, attempt.load(Ordering::SeqCst)))
    .notify(|err: &E, delay: Duration| {
        tracing::debug!(
            attempt = attempt.load(Ordering::SeqCst),
            retries = policy.retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Attempt failed, retrying"
        );
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Boom(usize);

    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "boom #{}", self.0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_k_failures() {
        let k = 3;
        let mut calls = 0;

        let policy = RetryPolicy::new(k + 2, Duration::from_millis(50));
        let result = run(&policy, || {
            calls += 1;
            let current = calls;
            async move {
                if current <= k {
                    Err(Boom(current))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls, k + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let mut calls = 0;

        let policy = RetryPolicy::new(4, Duration::from_millis(10));
        let result: Result<(), Boom> = run(&policy, || {
            calls += 1;
            let current = calls;
            async move { Err(Boom(current)) }
        })
        .await;

        assert_eq!(result, Err(Boom(4)));
        assert_eq!(calls, 4);
    }

    #[tokio::test]
    async fn test_single_attempt_never_retries() {
        let mut calls = 0;

        let result: Result<(), Boom> = run(&RetryPolicy::once(), || {
            calls += 1;
            async { Err(Boom(1)) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_stops_early() {
        let mut calls = 0;

        let policy = RetryPolicy::new(5, Duration::from_millis(10))
            .with_predicate(|_: &Boom, attempt| attempt <= 2);
        let result: Result<(), Boom> = run(&policy, || {
            calls += 1;
            let current = calls;
            async move { Err(Boom(current)) }
        })
        .await;

        assert_eq!(result, Err(Boom(3)));
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_is_fixed_between_attempts() {
        let start = tokio::time::Instant::now();

        let policy = RetryPolicy::new(3, Duration::from_secs(2));
        let _: Result<(), Boom> = run(&policy, || async { Err(Boom(0)) }).await;

        // Two sleeps of exactly two seconds, no growth.
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_transient_policy_does_not_retry_reverts() {
        let mut calls = 0;

        let policy = RetryPolicy::transient(5, Duration::ZERO);
        let result: Result<(), DeployError> = run(&policy, || {
            calls += 1;
            async {
                Err(DeployError::Reverted {
                    tx_hash: Default::default(),
                    reason: "execution reverted".to_string(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(DeployError::Reverted { .. })));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_zero_retries_is_clamped() {
        let policy: RetryPolicy<Boom> = RetryPolicy::new(0, Duration::ZERO);
        assert_eq!(policy.retries(), 1);
    }

    #[tokio::test]
    async fn test_zero_retries_runs_exactly_once() {
        let mut calls = 0;

        let policy = RetryPolicy::new(0, Duration::ZERO);
        let result: Result<(), Boom> = run(&policy, || {
            calls += 1;
            async { Err(Boom(1)) }
        })
        .await;

        assert_eq!(result, Err(Boom(1)));
        assert_eq!(calls, 1);
    }
}
