//! Fixed-delay retry loop for transport-level failures.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};

/// How often and how far apart a failed call is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. `0` disables retrying.
    pub retries: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub const NONE: Self = Self {
        retries: 0,
        delay: Duration::ZERO,
    };

    /// Create a policy.
    #[must_use]
    pub const fn new(retries: u32, delay: Duration) -> Self {
        Self { retries, delay }
    }

    /// Policy configured by `retry_count` and `retry_delay_ms`.
    #[must_use]
    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.retry_count, config.retry_delay())
    }

    /// Run `attempt` until it succeeds, fails with a non-retriable error or the retry
    /// budget is spent.
    ///
    /// `attempt` receives the 1-based attempt number and must build a fresh request each
    /// time. Once retries are exhausted the last underlying error is returned. Cancelling
    /// `cancel` aborts the running attempt or the pending delay with
    /// [`TransportError::Cancelled`].
    ///
    /// # Errors
    ///
    /// Returns the last error of `attempt`, or `Cancelled`.
    pub async fn run<T, F, Fut>(&self, cancel: Option<&CancellationToken>, mut attempt: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let never = CancellationToken::new();
        let cancel = cancel.unwrap_or(&never);
        let mut number = 1;

        loop {
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(TransportError::Cancelled),
                outcome = attempt(number) => outcome,
            };

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !error.is_retriable() || number > self.retries {
                if number > 1 {
                    tracing::warn!(attempts = number, error = %error, "Giving up after retries");
                }
                return Err(error);
            }

            tracing::warn!(
                attempt = number,
                retries = self.retries,
                delay_ms = u64::try_from(self.delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Attempt failed, retrying"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(TransportError::Cancelled),
                () = tokio::time::sleep(self.delay) => {}
            }
            number += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TransportConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn failing_then_ok(failures: u32, calls: Arc<AtomicU32>) -> impl FnMut(u32) -> std::future::Ready<Result<u32>> {
        move |number| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            assert_eq!(n, number);
            if n <= failures {
                std::future::ready(Err(TransportError::Connection(format!("refused #{n}"))))
            } else {
                std::future::ready(Ok(n))
            }
        }
    }

    #[tokio::test]
    async fn succeeds_after_n_plus_one_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(5, Duration::from_millis(20));

        let start = Instant::now();
        let result = policy.run(None, failing_then_ok(3, calls.clone())).await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(result, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(elapsed >= Duration::from_millis(60), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1000), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn exhausted_budget_returns_underlying_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(2, Duration::from_millis(5));

        let err = policy.run(None, failing_then_ok(10, calls.clone())).await.unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(err, TransportError::Connection(ref m) if m == "refused #3"));
    }

    #[tokio::test]
    async fn zero_retries_rejects_on_first_failure() {
        let calls = Arc::new(AtomicU32::new(0));

        let err = RetryPolicy::NONE
            .run(None, failing_then_ok(1, calls.clone()))
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, TransportError::Connection(_)));
    }

    #[tokio::test]
    async fn non_retriable_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let policy = RetryPolicy::new(5, Duration::from_millis(5));

        let err = policy
            .run(None, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Err::<(), _>(TransportError::AuthExpired))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, TransportError::AuthExpired));
    }

    #[tokio::test]
    async fn cancel_aborts_pending_delay() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(20, Duration::from_secs(3));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = policy
            .run(Some(&cancel), failing_then_ok(100, calls.clone()))
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn cancel_aborts_running_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = RetryPolicy::default()
            .run(Some(&cancel), |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::Cancelled));
    }
}
