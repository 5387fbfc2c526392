//! Retry utilities for calls to external collaborators.
//!
//! Provides configurable retry with exponential backoff. The caller supplies
//! a predicate deciding which errors are transient.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Configuration for retry behavior.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,
    /// Initial backoff duration before first retry.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to backoff duration.
    pub add_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with the specified max retries.
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Create a config with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Create a config for quick retries (smaller backoffs).
    pub fn quick() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Calculate backoff duration for a given attempt.
    fn backoff_duration(&self, attempt: u32) -> Duration {
        let backoff =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let backoff_ms = backoff.min(self.max_backoff.as_millis() as f64) as u64;

        let mut duration = Duration::from_millis(backoff_ms);

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = (backoff_ms as f64 * 0.25 * rand_jitter()) as u64;
            duration += Duration::from_millis(jitter);
        }

        duration
    }
}

/// Simple pseudo-random jitter (0.0 to 1.0) without external dependencies.
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

/// Execute an async operation with retry.
///
/// `is_retryable` classifies errors: permanent failures return immediately,
/// transient ones back off and retry up to `config.max_retries`.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    is_retryable: P,
    f: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(result) => {
                if attempt > 0 {
                    info!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "Call succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                if attempt >= config.max_retries {
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        error = %err,
                        "Call failed after max retries"
                    );
                    return Err(err);
                }

                if !is_retryable(&err) {
                    warn!(
                        operation = operation_name,
                        error = %err,
                        "Call failed with non-retryable error"
                    );
                    return Err(err);
                }

                let backoff = config.backoff_duration(attempt);
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    error = %err,
                    backoff_ms = backoff.as_millis(),
                    "Call failed, retrying after backoff"
                );

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_backoff, Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_duration() {
        let config = RetryConfig {
            add_jitter: false,
            ..Default::default()
        };

        assert_eq!(config.backoff_duration(0), Duration::from_millis(100));
        assert_eq!(config.backoff_duration(1), Duration::from_millis(200));
        assert_eq!(config.backoff_duration(2), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_retry_success_first_attempt() {
        let config = RetryConfig::default();
        let result = retry_with_backoff(&config, "test_op", |_e: &String| true, || async {
            Ok::<_, String>(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_permanent_failure_not_retried() {
        let config = RetryConfig::quick();
        let attempts = AtomicU32::new(0);
        let result = retry_with_backoff(
            &config,
            "test_op",
            |_e: &String| false,
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>("permanent".to_string())
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_transient_until_max() {
        let config = RetryConfig {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            backoff_multiplier: 1.0,
            add_jitter: false,
        };
        let attempts = AtomicU32::new(0);
        let result = retry_with_backoff(
            &config,
            "test_op",
            |_e: &String| true,
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>("transient".to_string())
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
