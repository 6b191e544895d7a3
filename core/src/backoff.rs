use crate::{Error, Result};
use backoff::backoff::Backoff;
use backoff::exponential::ExponentialBackoff;
use std::time::Duration;
use tracing::{debug, warn};

pub fn create_backoff(
    max_retries: u32,
    base_delay_ms: u64,
) -> ExponentialBackoff<backoff::SystemClock> {
    ExponentialBackoff {
        current_interval: Duration::from_millis(base_delay_ms),
        initial_interval: Duration::from_millis(base_delay_ms),
        randomization_factor: 0.5, // Add jitter
        multiplier: 2.0,
        max_interval: Duration::from_secs(60),
        max_elapsed_time: Some(Duration::from_secs(max_retries as u64 * 60)),
        ..ExponentialBackoff::default()
    }
}

/// Retry `operation` with exponential backoff, up to `max_retries` retries
/// after the first attempt.
///
/// Only errors that `Error::is_retryable` marks transient are retried; auth,
/// structural and coordination failures surface immediately. A rate-limited
/// provider names its own delay via `Error::RateLimit`.
pub async fn retry_transient<F, Fut, T>(
    operation: F,
    max_retries: u32,
    base_delay_ms: u64,
    operation_name: &str,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut backoff = create_backoff(max_retries, base_delay_ms);
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "Operation succeeded after retries"
                    );
                }
                return Ok(result);
            }
            Err(e) if !e.is_retryable() => {
                debug!(
                    operation = operation_name,
                    error = %e,
                    "Operation failed with a non-retryable error"
                );
                return Err(e);
            }
            Err(e) => {
                if attempts > max_retries {
                    warn!(
                        operation = operation_name,
                        attempts,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let delay = match &e {
                    Error::RateLimit { retry_after_secs } => {
                        Duration::from_secs(*retry_after_secs)
                    }
                    _ => backoff
                        .next_backoff()
                        .unwrap_or(Duration::from_millis(base_delay_ms)),
                };

                warn!(
                    operation = operation_name,
                    attempt = attempts,
                    retry_after_ms = delay.as_millis(),
                    error = %e,
                    "Operation failed, retrying"
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

    #[test]
    fn backoff_intervals_are_bounded() {
        let b = create_backoff(3, 100);
        assert_eq!(b.initial_interval, Duration::from_millis(100));
        assert_eq!(b.max_interval, Duration::from_secs(60));
        assert!(b.max_elapsed_time.is_some());
    }

    #[tokio::test]
    async fn gives_up_after_retry_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_transient(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Timeout(1))
            },
            2,
            1,
            "always_times_out",
        )
        .await;

        assert!(result.is_err());
        // First attempt plus two retries.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn auth_rejection_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_transient(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Auth {
                    provider: "gmail".into(),
                    details: "status 401".into(),
                })
            },
            5,
            1,
            "dead_credential",
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn structural_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_transient(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Structural("schema drift".into()))
            },
            5,
            1,
            "bad_shape",
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_on_later_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = retry_transient(
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 1 {
                    Err(Error::Storage("write conflict".into()))
                } else {
                    Ok(n)
                }
            },
            3,
            1,
            "flaky",
        )
        .await;

        assert_eq!(result.unwrap(), 1);
    }
}
