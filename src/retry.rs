//! Fixed-interval retry with a per-attempt time budget
//!
//! Every failure counts against the same budget; there is no retryable/fatal
//! split. The timeout covers one attempt and not the sleep between attempts.
//! Cancellation interrupts both the running attempt and the sleep.
//!
//! # Example
//!
//! ```no_run
//! use media_dl::retry::{RetryPolicy, run_with_retry};
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> media_dl::Result<()> {
//! let policy = RetryPolicy {
//!     attempts: 3,
//!     interval: Duration::from_secs(5),
//!     timeout: Duration::from_secs(600),
//! };
//! let value = run_with_retry(
//!     &policy,
//!     &CancellationToken::new(),
//!     |retry_left, err| eprintln!("{err}, {retry_left} attempts left"),
//!     |_attempt| async { Ok::<_, media_dl::Error>(42) },
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How often and how long to try
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first one (values below 1 behave as 1)
    pub attempts: u32,
    /// Sleep between attempts
    pub interval: Duration,
    /// Time budget for a single attempt
    pub timeout: Duration,
}

/// Run `operation` until it succeeds or `policy.attempts` attempts have failed
///
/// `operation` receives the 1-based attempt number. After a failed attempt that
/// still leaves budget, `on_retry(retry_left, &error)` is called and the loop
/// sleeps `policy.interval`. The last attempt's error is returned unchanged; an
/// attempt exceeding `policy.timeout` fails with [`Error::Timeout`].
///
/// # Errors
///
/// [`Error::Cancelled`] as soon as `cancel` fires, whether an attempt is running
/// or the loop is sleeping.
pub async fn run_with_retry<F, Fut, T, R>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut on_retry: R,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    R: FnMut(u32, &Error),
{
    let attempts = policy.attempts.max(1);

    for attempt in 1..=attempts {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(policy.timeout, operation(attempt)) => {
                result.unwrap_or_else(|_| Err(Error::Timeout(policy.timeout)))
            }
        };

        let err = match outcome {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempts = attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => e,
        };

        if attempt == attempts {
            tracing::error!(
                error = %err,
                attempts,
                "Operation failed after all retry attempts exhausted"
            );
            return Err(err);
        }

        let retry_left = attempts - attempt;
        tracing::warn!(
            error = %err,
            attempt,
            retry_left,
            delay_ms = policy.interval.as_millis(),
            "Operation failed, retrying"
        );
        on_retry(retry_left, &err);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(policy.interval) => {}
        }
    }

    // attempts >= 1, so the loop always returns
    Err(Error::Cancelled)
}
