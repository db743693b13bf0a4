//! Timeouts and bounded exponential backoff
//!
//! Every call to an external collaborator goes through [`with_timeout`]; a
//! timed-out call is a [`DrxError::Timeout`], never success-by-default.

use crate::error::DrxError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Bounded exponential backoff policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    #[inline]
    #[must_use]
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff_ms: u64::try_from(initial_backoff.as_millis()).unwrap_or(u64::MAX),
            max_backoff_ms: 60_000,
        }
    }

    /// Single attempt, no retries
    #[inline]
    #[must_use]
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    #[must_use]
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
        }
    }
}

/// Result of a retried operation plus how many attempts it took
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, DrxError>,
    pub attempts: u32,
}

impl<T> RetryOutcome<T> {
    /// Drop the attempt count
    #[inline]
    pub fn into_result(self) -> Result<T, DrxError> {
        self.result
    }
}

/// Run `fut` with a deadline
///
/// # Errors
/// `DrxError::Timeout` if the deadline elapses, otherwise the future's error.
pub async fn with_timeout<T, F>(operation: &str, limit: Duration, fut: F) -> Result<T, DrxError>
where
    F: Future<Output = Result<T, DrxError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(DrxError::Timeout {
            operation: operation.to_string(),
            after_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

/// Retry `op` with exponential backoff while it fails with a retryable error
///
/// Non-retryable errors stop immediately. Each attempt is bounded by
/// `attempt_timeout`.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    attempt_timeout: Duration,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, DrxError>>,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match with_timeout(operation, attempt_timeout, op(attempt)).await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(err) if err.is_retryable() && attempt < max => {
                let delay = policy.backoff_after(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    max_attempts = max,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "retrying after failure"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                return RetryOutcome {
                    result: Err(err),
                    attempts: attempt,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
        };
        assert_eq!(policy.backoff_after(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_after(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_after(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_after(4), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, Duration::from_secs(1));

        let c = calls.clone();
        let outcome = retry_with_backoff(&policy, "upload", Duration::from_secs(5), move |_| {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(DrxError::transient("upload", "503"))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result.unwrap(), "done");
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let outcome: RetryOutcome<()> =
            retry_with_backoff(&policy, "upload", Duration::from_secs(1), |_| async {
                Err(DrxError::transient("upload", "reset"))
            })
            .await;

        assert_eq!(outcome.attempts, 3);
        assert!(outcome.result.unwrap_err().is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_stops_immediately() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10));
        let outcome: RetryOutcome<()> =
            retry_with_backoff(&policy, "snapshot", Duration::from_secs(1), |_| async {
                Err(DrxError::Config("bad".into()))
            })
            .await;

        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_failure() {
        let result: Result<(), DrxError> =
            with_timeout("health_check", Duration::from_millis(50), async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        assert!(matches!(
            result,
            Err(DrxError::Timeout { after_ms: 50, .. })
        ));
    }
}
