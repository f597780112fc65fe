//! Retry and backoff utilities.
//!
//! Two flavors live here: `retry_with_backoff` for in-process retries of
//! transient I/O (catalog fetches, status writes), and `backoff_delay` for
//! computing per-object requeue intervals in the reconciler, where the retry
//! loop is the controller's work queue rather than a local loop.

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Compute the requeue delay for the given failure attempt count.
///
/// Exponential growth from `base`, capped at `max`. Attempt 0 is the first
/// failure. No jitter: the controller's work queue already spreads objects
/// out, and deterministic delays keep the per-object cadence testable.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = attempt.min(16); // 2^16 * any sane base saturates the cap
    let delay = base.as_secs_f64() * 2f64.powi(exp as i32);
    Duration::from_secs_f64(delay.min(max.as_secs_f64()))
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries until success, or until `max_attempts` is exhausted when set.
/// Jitter (0.5x to 1.5x) avoids synchronized retries across objects.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_delay_doubles_until_cap() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(120);
        assert_eq!(backoff_delay(0, base, max), Duration::from_secs(5));
        assert_eq!(backoff_delay(1, base, max), Duration::from_secs(10));
        assert_eq!(backoff_delay(2, base, max), Duration::from_secs(20));
        assert_eq!(backoff_delay(4, base, max), Duration::from_secs(80));
        assert_eq!(backoff_delay(5, base, max), Duration::from_secs(120));
        assert_eq!(backoff_delay(30, base, max), Duration::from_secs(120));
    }

    #[test]
    fn backoff_delay_slow_cadence_caps_at_ten_minutes() {
        let base = Duration::from_secs(30);
        let max = Duration::from_secs(600);
        assert_eq!(backoff_delay(0, base, max), Duration::from_secs(30));
        assert_eq!(backoff_delay(3, base, max), Duration::from_secs(240));
        assert_eq!(backoff_delay(10, base, max), Duration::from_secs(600));
    }

    #[tokio::test]
    async fn retry_succeeds_immediately() {
        let config = RetryConfig::with_max_attempts(3);
        let result: Result<i32, &str> =
            retry_with_backoff(&config, "op", || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn retry_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        };

        let result: Result<i32, &str> = retry_with_backoff(&config, "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("fail")
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let config = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        };

        let result: Result<i32, &str> = retry_with_backoff(&config, "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("always fails")
            }
        })
        .await;

        assert_eq!(result, Err("always fails"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
