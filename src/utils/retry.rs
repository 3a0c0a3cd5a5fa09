//! Retry utilities for resilient venue calls

use std::time::Duration;
use tracing::{error, warn};

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries
    pub max_retries: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, initial_delay_ms: u64) -> Self {
        Self {
            max_retries,
            initial_delay_ms,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Retry a future with exponential backoff.
///
/// `should_retry` classifies errors: returning false aborts immediately,
/// so venue rejections are never replayed.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    operation_name: &str,
    config: RetryConfig,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut delay_ms = config.initial_delay_ms;

    for attempt in 0..=config.max_retries {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !should_retry(&e) || attempt == config.max_retries {
                    error!(
                        "{} failed after {} attempt(s): {}",
                        operation_name,
                        attempt + 1,
                        e
                    );
                    return Err(e);
                }
                warn!(
                    "{} failed (attempt {}/{}), retrying in {}ms: {}",
                    operation_name,
                    attempt + 1,
                    config.max_retries + 1,
                    delay_ms,
                    e
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = ((delay_ms as f64 * config.backoff_multiplier) as u64)
                    .min(config.max_delay_ms);
            }
        }
    }
    unreachable!("retry loop always returns")
}

/// Retry every error with the default configuration
pub async fn retry<F, Fut, T, E>(operation_name: &str, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff(operation_name, RetryConfig::default(), |_| true, operation).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_success_first_attempt() {
        let result = retry("test", || async { Ok::<i32, &str>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let counter = AtomicU32::new(0);

        let result = retry_with_backoff("test", RetryConfig::new(3, 10), |_| true, || async {
            let count = counter.fetch_add(1, Ordering::SeqCst);
            if count < 2 {
                Err::<&str, &str>("fail")
            } else {
                Ok("success")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let counter = AtomicU32::new(0);

        let result = retry_with_backoff("test", RetryConfig::new(2, 10), |_| true, || async {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<&str, &str>("always fail")
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3); // initial + 2 retries
    }

    #[tokio::test]
    async fn test_non_retryable_aborts_immediately() {
        let counter = AtomicU32::new(0);

        let result = retry_with_backoff("test", RetryConfig::new(5, 10), |_| false, || async {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<&str, &str>("rejected")
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
