//! Transient-Fault Retry Executor
//!
//! Generic retry wrapper with exponential backoff. Takes the operation
//! as an async closure and the fault classifier as a plain function, so
//! the policy is reusable and testable away from any store client.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Retry policy governing attempts and backoff for transient faults
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts per operation (first try included)
    pub max_attempts: u32,
    /// Initial backoff delay
    pub base_delay: Duration,
    /// Backoff ceiling
    pub max_delay: Duration,
    /// Backoff growth factor between attempts
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before the attempt following `attempt` failures:
    /// `min(base * multiplier^(attempt-1), max)`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}

/// Execute `op`, retrying transient faults per `policy`.
///
/// `classify` decides whether a fault is worth retrying. Terminal
/// faults (including cancellation) propagate immediately with no delay.
/// On exhaustion the last fault is wrapped with the operation name and
/// attempt count. Backoff sleeps race `cancel`; cancellation during a
/// backoff surfaces as `Error::Cancelled`, never as exhaustion.
pub async fn execute_with_retry<T, F, Fut, C>(
    operation: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    classify: C,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    C: Fn(&Error) -> bool,
{
    let mut attempt: u32 = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if matches!(e, Error::Cancelled) || !classify(&e) {
                    return Err(e);
                }

                if attempt >= policy.max_attempts {
                    return Err(Error::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }

                let delay = policy.delay_for_attempt(attempt);
                tracing::debug!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    operation,
                    attempt,
                    policy.max_attempts,
                    delay,
                    e
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }

                attempt += 1;
            }
        }
    }
}

/// Run `fut` to completion unless the layer-wide shutdown token fires
/// first, in which case any outstanding retry loop inside it is
/// dropped and the caller sees `Error::ShuttingDown`.
pub async fn with_shutdown<T>(
    shutdown: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err(Error::ShuttingDown),
        result = fut => result,
    }
}

/// Retry `op` using the crate's standard transient-fault classification
pub async fn retry_transient<T, F, Fut>(
    operation: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    execute_with_retry(operation, policy, cancel, Error::is_retryable, op).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn test_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = test_policy();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        // Capped at the ceiling
        assert_eq!(policy.delay_for_attempt(30), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_faults() {
        let policy = test_policy();
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicU32::new(0));

        let started = tokio::time::Instant::now();
        let counter = Arc::clone(&attempts);
        let result = retry_transient("kv get", &policy, &cancel, move || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(Error::Timeout("kv get".into()))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // 100ms after the first fault, 200ms after the second
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_fault_fails_immediately() {
        let policy = test_policy();
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicU32::new(0));

        let started = tokio::time::Instant::now();
        let counter = Arc::clone(&attempts);
        let result: Result<u32> = retry_transient("kv acquire", &policy, &cancel, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Store("invalid session id".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Store(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_names_operation_and_attempts() {
        let policy = test_policy();
        let cancel = CancellationToken::new();

        let result: Result<u32> = retry_transient("session list", &policy, &cancel, || async {
            Err(Error::StoreUnavailable("503".into()))
        })
        .await;

        match result {
            Err(Error::RetriesExhausted { operation, attempts, source }) => {
                assert_eq!(operation, "session list");
                assert_eq!(attempts, 3);
                assert!(matches!(*source, Error::StoreUnavailable(_)));
            }
            other => panic!("Expected RetriesExhausted, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff() {
        let policy = test_policy();
        let cancel = CancellationToken::new();

        // First fault is transient; the token is cancelled before the
        // backoff sleep can elapse.
        let token = cancel.clone();
        let result: Result<u32> = retry_transient("kv put", &policy, &cancel, move || {
            let token = token.clone();
            async move {
                token.cancel();
                Err(Error::Timeout("kv put".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_short_circuits() {
        let policy = test_policy();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<u32> =
            retry_transient("kv get", &policy, &cancel, || async { Ok(1) }).await;

        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_custom_classifier() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            ..test_policy()
        };
        let cancel = CancellationToken::new();

        // NotFound is terminal under the standard classifier; a custom
        // classifier may still choose to retry it.
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let result: Result<u32> = execute_with_retry(
            "read one",
            &policy,
            &cancel,
            |e| matches!(e, Error::NotFound(_)),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::NotFound("10.0.0.1:7654@1".into()))
                }
            },
        )
        .await;

        assert!(matches!(result, Err(Error::RetriesExhausted { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
