//! Bounded retries with doubling backoff
//!
//! Catalog writes and broker lookups both go through [`with_retry_if`]; the
//! caller decides which errors are worth another attempt.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// How many times to retry and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts after the first one
    pub retries: u32,
    /// Wait before the first retry; doubled for each one after
    pub initial_backoff: Duration,
    /// Upper bound on any single wait
    pub max_backoff: Duration,
}

impl RetryConfig {
    pub fn new(retries: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            retries,
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
        }
    }

    /// Single attempt, no waiting
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Wait before retry number `retry` (1-based)
    fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Error from the final attempt, with the number of attempts made
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub error: E,
}

/// Run `operation` until it succeeds, `should_retry` rejects its error, or
/// the retries run out.
///
/// ```no_run
/// use std::time::Duration;
/// use mop_orchestrator::utils::retry::{with_retry_if, RetryConfig};
///
/// # async fn example() {
/// let config = RetryConfig::new(2, Duration::from_millis(200), Duration::from_secs(1));
/// let result = with_retry_if(&config, || async { Ok::<_, std::io::Error>(42) }, |_| true).await;
/// assert_eq!(result.map_err(|e| e.attempts).ok(), Some(42));
/// # }
/// ```
pub async fn with_retry_if<T, E, F, Fut, P>(
    config: &RetryConfig,
    operation: F,
    should_retry: P,
) -> Result<T, RetryExhausted<E>>
where
    E: Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut retry = 0;
    loop {
        let error = match operation().await {
            Ok(value) => {
                if retry > 0 {
                    debug!(retry, "Succeeded on retry");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        let attempts = retry + 1;
        if retry >= config.retries || !should_retry(&error) {
            return Err(RetryExhausted { attempts, error });
        }

        retry += 1;
        let wait = config.backoff(retry);
        warn!(
            attempt = attempts,
            retries = config.retries,
            wait_ms = wait.as_millis() as u64,
            error = %error,
            "Attempt failed, retrying"
        );
        tokio::time::sleep(wait).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(retries: u32) -> RetryConfig {
        RetryConfig::new(retries, Duration::from_millis(100), Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);

        let result = with_retry_if(
            &quick(3),
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("busy".to_string())
                } else {
                    Ok(7)
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result.map_err(|e| e.error).unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_retries() {
        let result: Result<(), _> =
            with_retry_if(&quick(1), || async { Err("down".to_string()) }, |_| true).await;

        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 2);
        assert_eq!(exhausted.error, "down");
    }

    #[tokio::test]
    async fn test_rejected_error_is_not_retried() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = with_retry_if(
            &quick(5),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("not found".to_string())
            },
            |e| !e.contains("not found"),
        )
        .await;

        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let config = quick(10);
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(4), Duration::from_millis(800));
        assert_eq!(config.backoff(5), Duration::from_secs(1));
        assert_eq!(config.backoff(40), Duration::from_secs(1));
        assert_eq!(RetryConfig::none().backoff(1), Duration::ZERO);
    }
}
