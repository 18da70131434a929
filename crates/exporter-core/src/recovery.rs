//! Retry with exponential backoff.
//!
//! ## Features
//!
//! - **Exponential backoff**: 1s, 2s, 4s, ... by default
//! - **Server hints**: an error can carry its own delay (e.g. `Retry-After`),
//!   which replaces the computed backoff for that attempt
//! - **Early stop**: errors that report themselves as non-retryable end the loop
//! - **Jitter**: optional, off by default
//!
//! ## Example
//!
//! ```no_run
//! use exporter_core::recovery::{retry_with_backoff_async, Retryable, RetryConfig};
//!
//! #[derive(Debug)]
//! struct Flaky;
//! impl std::fmt::Display for Flaky {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "flaky")
//!     }
//! }
//! impl Retryable for Flaky {
//!     fn is_retryable(&self) -> bool { true }
//! }
//!
//! # async fn example() {
//! let outcome = retry_with_backoff_async(&RetryConfig::default(), || async {
//!     Err::<(), Flaky>(Flaky)
//! })
//! .await;
//! assert_eq!(outcome.attempts, 4);
//! # }
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum computed delay between retries (caps exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (2.0 doubles each time).
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.25 = ±25%). Zero disables it.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

impl RetryConfig {
    /// Default backoff with a custom retry count.
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Near-zero delays, for tests that exercise the retry loop.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `attempt` (0-based): initial × multiplier^attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay.as_secs_f64());

        if self.jitter <= 0.0 || capped_delay <= 0.0 {
            return Duration::from_secs_f64(capped_delay);
        }

        let jitter_range = capped_delay * self.jitter;
        let mut rng = rand::rng();
        let jitter = rng.random_range(-jitter_range..jitter_range);
        let final_delay = (capped_delay + jitter)
            .max(0.0)
            .min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(final_delay)
    }
}

/// Trait for errors that know whether the failed operation is worth retrying.
pub trait Retryable {
    /// Returns true if the operation that caused this error should be retried.
    fn is_retryable(&self) -> bool;

    /// A delay requested by the remote side, used instead of the computed backoff.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Result of a retry operation with metadata about the attempts.
#[derive(Debug)]
pub struct RetryResult<T> {
    /// The final result (success or last error).
    pub result: T,
    /// Number of attempts made.
    pub attempts: u32,
    /// Total time spent, including waits.
    pub total_duration: Duration,
}

/// Retry an async operation with exponential backoff.
///
/// Stops at the first success, at the first non-retryable error, or once
/// `max_retries` retries have failed. The last error is returned in the
/// latter two cases.
pub async fn retry_with_backoff_async<T, E, F, Fut>(
    config: &RetryConfig,
    mut operation: F,
) -> RetryResult<Result<T, E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let start = std::time::Instant::now();
    let mut attempts = 0;

    loop {
        attempts += 1;

        match operation().await {
            Ok(value) => {
                if attempts > 1 {
                    info!(
                        attempts,
                        total_ms = start.elapsed().as_millis() as u64,
                        "Operation succeeded after retry"
                    );
                }
                return RetryResult {
                    result: Ok(value),
                    attempts,
                    total_duration: start.elapsed(),
                };
            }
            Err(e) if !e.is_retryable() => {
                debug!(attempt = attempts, error = %e, "Operation failed with non-retryable error");
                return RetryResult {
                    result: Err(e),
                    attempts,
                    total_duration: start.elapsed(),
                };
            }
            Err(e) => {
                if attempts > config.max_retries {
                    warn!(
                        attempts,
                        max_retries = config.max_retries,
                        total_ms = start.elapsed().as_millis() as u64,
                        error = %e,
                        "Operation failed after all retries"
                    );
                    return RetryResult {
                        result: Err(e),
                        attempts,
                        total_duration: start.elapsed(),
                    };
                }

                let delay = e
                    .retry_after()
                    .unwrap_or_else(|| config.delay_for_attempt(attempts - 1));
                debug!(
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying with backoff"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError {
        retryable: bool,
        retry_after: Option<Duration>,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error (retryable={})", self.retryable)
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            self.retryable
        }

        fn retry_after(&self) -> Option<Duration> {
            self.retry_after
        }
    }

    fn transient() -> TestError {
        TestError {
            retryable: true,
            retry_after: None,
        }
    }

    #[test]
    fn test_default_backoff_sequence() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(20), config.max_delay);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = RetryConfig {
            jitter: 0.25,
            ..RetryConfig::default()
        };
        for _ in 0..50 {
            let d = config.delay_for_attempt(1);
            assert!(d >= Duration::from_millis(1500) && d <= Duration::from_millis(2500));
        }
    }

    #[tokio::test]
    async fn test_retry_success_first_try() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let outcome = retry_with_backoff_async(&RetryConfig::immediate(3), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<i32, TestError>(42)
        })
        .await;

        assert_eq!(outcome.result.unwrap(), 42);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let outcome = retry_with_backoff_async(&RetryConfig::immediate(3), move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(transient())
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(outcome.result.unwrap(), 7);
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let outcome = retry_with_backoff_async(&RetryConfig::immediate(2), || async {
            Err::<(), _>(transient())
        })
        .await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 3); // 1 initial + 2 retries
    }

    #[tokio::test]
    async fn test_non_retryable_stops_immediately() {
        let outcome = retry_with_backoff_async(&RetryConfig::immediate(5), || async {
            Err::<(), _>(TestError {
                retryable: false,
                retry_after: None,
            })
        })
        .await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_after_overrides_backoff() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(30),
            ..RetryConfig::default()
        };
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let outcome = retry_with_backoff_async(&config, move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(TestError {
                    retryable: true,
                    retry_after: Some(Duration::from_millis(5)),
                })
            } else {
                Ok(())
            }
        })
        .await;

        assert!(outcome.result.is_ok());
        assert!(outcome.total_duration < Duration::from_secs(5));
    }
}
