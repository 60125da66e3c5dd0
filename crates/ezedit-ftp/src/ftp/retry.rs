//! Retry-wrapped execution with exponential backoff.
//!
//! ```no_run
//! use ezedit_ftp::{with_retry, FtpError, RetryOptions};
//!
//! # async fn example() -> Result<(), FtpError> {
//! let listing = with_retry(&RetryOptions::default(), || async {
//!     Ok::<_, FtpError>(vec!["index.html".to_string()])
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use crate::ftp::backoff::{Backoff, BackoffStep};
use crate::ftp::types::RetryOptions;
use std::fmt;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Classifies errors as transient (worth retrying) or terminal.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Why a retry loop gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every attempt failed with a retryable error.
    Exhausted,
    /// A non-retryable error ended the loop early.
    Terminal,
    /// The cancellation token fired.
    Cancelled,
}

/// Final failure of a retried operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryFailure<E> {
    /// The last error observed, unchanged.
    pub error: E,
    /// Attempts actually made (first try included).
    pub attempts: u32,
    pub reason: StopReason,
}

impl<E: fmt::Display> fmt::Display for RetryFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:?} after {} attempts)",
            self.error, self.reason, self.attempts
        )
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryFailure<E> {}

/// Marker error for a cancelled retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// Run `op` until it succeeds, fails terminally, or the budget runs out.
///
/// Total attempts are at most `opts.max_retries + 1`. Delays follow
/// [`Backoff`].
pub async fn with_retry<T, E, F, Fut>(opts: &RetryOptions, mut op: F) -> Result<T, RetryFailure<E>>
where
    E: Retryable + fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut backoff = Backoff::new(opts.clone());
    let mut attempt = 0u32;

    loop {
        let error = match op().await {
            Ok(value) => {
                if attempt > 0 {
                    log::debug!("Operation succeeded on attempt {}", attempt + 1);
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !error.is_retryable() {
            return Err(RetryFailure {
                error,
                attempts: attempt + 1,
                reason: StopReason::Terminal,
            });
        }

        match backoff.next_step(attempt) {
            BackoffStep::Exhausted => {
                log::warn!("Giving up after {} attempts: {}", attempt + 1, error);
                return Err(RetryFailure {
                    error,
                    attempts: attempt + 1,
                    reason: StopReason::Exhausted,
                });
            }
            BackoffStep::Wait(delay) => {
                log::warn!(
                    "Attempt {}/{} failed: {} - retrying in {}ms",
                    attempt + 1,
                    opts.max_retries + 1,
                    error,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}

/// Like [`with_retry`], but aborts the in-flight attempt or backoff sleep
/// as soon as `token` is cancelled.
pub async fn with_retry_cancellable<T, E, F, Fut>(
    opts: &RetryOptions,
    token: &CancellationToken,
    mut op: F,
) -> Result<T, RetryFailure<E>>
where
    E: Retryable + fmt::Display + From<Cancelled>,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let cancelled = |attempts: u32| RetryFailure {
        error: E::from(Cancelled),
        attempts,
        reason: StopReason::Cancelled,
    };

    let mut backoff = Backoff::new(opts.clone());
    let mut attempt = 0u32;

    loop {
        if token.is_cancelled() {
            return Err(cancelled(attempt));
        }

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            res = op() => Some(res),
        };
        let error = match outcome {
            None => {
                log::debug!("Attempt {} cancelled in flight", attempt + 1);
                return Err(cancelled(attempt + 1));
            }
            Some(Ok(value)) => return Ok(value),
            Some(Err(e)) => e,
        };

        if !error.is_retryable() {
            return Err(RetryFailure {
                error,
                attempts: attempt + 1,
                reason: StopReason::Terminal,
            });
        }

        match backoff.next_step(attempt) {
            BackoffStep::Exhausted => {
                log::warn!("Giving up after {} attempts: {}", attempt + 1, error);
                return Err(RetryFailure {
                    error,
                    attempts: attempt + 1,
                    reason: StopReason::Exhausted,
                });
            }
            BackoffStep::Wait(delay) => {
                log::warn!(
                    "Attempt {}/{} failed: {} - retrying in {}ms",
                    attempt + 1,
                    opts.max_retries + 1,
                    error,
                    delay.as_millis()
                );
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(cancelled(attempt + 1)),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::error::{FtpError, FtpErrorKind};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_two_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let result = with_retry(&RetryOptions::default(), || {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(FtpError::connection_reset("Temporary failure"))
                } else {
                    Ok("Success")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "Success");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(3000));
        assert!(waited < Duration::from_millis(3100));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));

        let failure = with_retry(&RetryOptions::default(), || {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err::<(), _>(FtpError::timeout(format!("Persistent Failure #{}", n)))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(failure.attempts, 4);
        assert_eq!(failure.reason, StopReason::Exhausted);
        assert_eq!(failure.error.message, "Persistent Failure #4");
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));

        let failure = with_retry(&RetryOptions::default(), || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(FtpError::auth_failed("530 Login incorrect"))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.reason, StopReason::Terminal);
        assert_eq!(failure.error.kind, FtpErrorKind::AuthFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn capped_delay_is_used_for_second_retry() {
        let opts = RetryOptions::new(2, 10_000, 3.0, 15_000);
        let started = Instant::now();

        let _ = with_retry(&opts, || async {
            Err::<(), _>(FtpError::disconnected("client is closed"))
        })
        .await;

        // 10000 then min(30000, 15000)
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(25_000));
        assert!(waited < Duration::from_millis(25_100));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_stops_loop() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                token.cancel();
            })
        };

        let failure = with_retry_cancellable(&RetryOptions::default(), &token, || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(FtpError::timeout("slow"))
            }
        })
        .await
        .unwrap_err();
        canceller.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(failure.reason, StopReason::Cancelled);
        assert_eq!(failure.error.kind, FtpErrorKind::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_aborts_in_flight_attempt() {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            child.cancel();
        });

        let failure = with_retry_cancellable(&RetryOptions::default(), &token, || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, FtpError>(())
        })
        .await
        .unwrap_err();

        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.reason, StopReason::Cancelled);
    }

    #[tokio::test]
    async fn already_cancelled_token_makes_no_attempt() {
        let token = CancellationToken::new();
        token.cancel();
        let calls = AtomicU32::new(0);

        let failure = with_retry_cancellable(&RetryOptions::default(), &token, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, FtpError>(()) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(failure.attempts, 0);
    }
}
