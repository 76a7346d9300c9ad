//! Bounded retry of a single remote call with a fixed delay.
//!
//! [`invoke_with_retry`] re-invokes a call until it succeeds, returns an
//! error that is not retryable, or runs out of attempts. Attempt counters
//! live only in the calling future: a restart mid-retry starts the budget
//! again.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_DELAY_MS};
use crate::types::failure::{FailureDetail, FailureKind};

fn default_max_attempts() -> u32 {
    DEFAULT_RETRY_ATTEMPTS
}

fn default_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

/// Attempt budget and fixed delay for one call site.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use armada_tasks::retry::RetryPolicy;
///
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.max_attempts, 3);
/// assert_eq!(policy.delay(), Duration::from_secs(1));
///
/// let policy: RetryPolicy = serde_json::from_str(r#"{"max_attempts": 10}"#).unwrap();
/// assert_eq!(policy.max_attempts, 10);
/// assert_eq!(policy.delay_ms, 1_000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero behaves as one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Fixed delay between attempts.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// A single attempt, no retries.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Errors a retried call can produce.
///
/// The default treats every error as transient.
pub trait RetryableError: fmt::Display {
    /// `false` stops retrying immediately.
    fn is_retryable(&self) -> bool {
        true
    }

    /// Remote status code carried into the failure detail.
    fn status_code(&self) -> Option<u16> {
        None
    }
}

impl RetryableError for String {}

impl RetryableError for FailureDetail {
    /// Validation failures and client errors other than 408/429 are final.
    fn is_retryable(&self) -> bool {
        if self.kind == FailureKind::Validation {
            return false;
        }
        !matches!(self.status_code, Some(code) if (400..500).contains(&code) && code != 408 && code != 429)
    }

    fn status_code(&self) -> Option<u16> {
        self.status_code
    }
}

/// Final error of a retried call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryError<E> {
    /// Attempts made, including the last one.
    pub attempts: u32,
    pub last_error: E,
    /// `true` when the budget ran out, `false` when the error was final.
    pub exhausted: bool,
}

impl<E: RetryableError> RetryError<E> {
    /// Failure detail recorded on the owning task.
    ///
    /// An exhausted budget yields [`FailureKind::RetryExhausted`]; a
    /// non-retryable error yields [`FailureKind::Remote`]. The message is
    /// the last error's.
    pub fn into_failure(self) -> FailureDetail {
        let kind = if self.exhausted {
            FailureKind::RetryExhausted
        } else {
            FailureKind::Remote
        };
        let mut failure = FailureDetail::new(kind, self.last_error.to_string());
        failure.status_code = self.last_error.status_code();
        failure
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (after {} attempts)", self.last_error, self.attempts)
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

/// Runs `call` until it succeeds or the policy gives up.
///
/// `call` receives the 1-based attempt number. `operation` names the call
/// site in log output.
///
/// # Errors
///
/// Returns [`RetryError`] with the last error when the error is not
/// retryable or `policy.max_attempts` attempts all failed.
///
/// # Examples
///
/// ```
/// use armada_tasks::retry::{invoke_with_retry, RetryPolicy};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let policy = RetryPolicy::new(3, std::time::Duration::ZERO);
/// let result = invoke_with_retry("lookup", &policy, |attempt| async move {
///     if attempt < 2 { Err("not yet".to_string()) } else { Ok(attempt) }
/// })
/// .await;
/// assert_eq!(result.unwrap(), 2);
/// # });
/// ```
pub async fn invoke_with_retry<T, E, F, Fut>(
    operation: &str,
    policy: &RetryPolicy,
    mut call: F,
) -> Result<T, RetryError<E>>
where
    E: RetryableError,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match call(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(operation, attempt, "call succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) if !error.is_retryable() => {
                tracing::warn!(operation, attempt, error = %error, "call failed with non-retryable error");
                return Err(RetryError {
                    attempts: attempt,
                    last_error: error,
                    exhausted: false,
                });
            }
            Err(error) if attempt >= max_attempts => {
                tracing::warn!(operation, attempt, error = %error, "retry budget exhausted");
                return Err(RetryError {
                    attempts: attempt,
                    last_error: error,
                    exhausted: true,
                });
            }
            Err(error) => {
                tracing::debug!(
                    operation,
                    attempt,
                    retries_left = max_attempts - attempt,
                    error = %error,
                    "call failed, retrying"
                );
                tokio::time::sleep(policy.delay()).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Fatal;

    impl fmt::Display for Fatal {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "bad request")
        }
    }

    impl RetryableError for Fatal {
        fn is_retryable(&self) -> bool {
            false
        }
        fn status_code(&self) -> Option<u16> {
            Some(400)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_call_uses_whole_budget() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let started = tokio::time::Instant::now();
        let err = invoke_with_retry("lookup", &policy, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("boom".to_string()) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.attempts, 3);
        assert!(err.exhausted);
        assert!(started.elapsed() >= Duration::from_secs(2));

        let failure = err.into_failure();
        assert_eq!(failure.kind, FailureKind::RetryExhausted);
        assert_eq!(failure.message, "boom");
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_second_attempt() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let value = invoke_with_retry("lookup", &policy, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 1 {
                    Err("flaky".to_string())
                } else {
                    Ok("done")
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_at_once() {
        let calls = AtomicU32::new(0);
        let err = invoke_with_retry("lookup", &RetryPolicy::default(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Fatal) }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!err.exhausted);
        let failure = err.into_failure();
        assert_eq!(failure.kind, FailureKind::Remote);
        assert_eq!(failure.status_code, Some(400));
    }

    #[tokio::test]
    async fn zero_attempts_means_one() {
        let calls = AtomicU32::new(0);
        let _ = invoke_with_retry("lookup", &RetryPolicy::new(0, Duration::ZERO), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("x".to_string()) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failure_detail_retryability() {
        assert!(FailureDetail::remote("x").is_retryable());
        assert!(FailureDetail::remote("x").with_status_code(503).is_retryable());
        assert!(FailureDetail::remote("x").with_status_code(429).is_retryable());
        assert!(!FailureDetail::remote("x").with_status_code(404).is_retryable());
        assert!(!FailureDetail::validation("x").is_retryable());
    }
}
