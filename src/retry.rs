//! Bounded retry with exponential backoff and jitter.
//!
//! Every step of a reconcile that touches the cluster goes through
//! [`retry_with_backoff`]. The budget is always finite: once exhausted the
//! last error is returned and redelivery becomes the job of the notification
//! feed, not of this module.
//!
//! # Example
//!
//! ```ignore
//! use autorestart::retry::{retry_with_backoff, RetryConfig};
//!
//! let pods = retry_with_backoff(
//!     &RetryConfig::default(),
//!     "list pods",
//!     |e: &Error| e.is_retryable(),
//!     || async { store.list_workloads("fedx-1000").await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Backoff policy for operations that may fail transiently.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Total number of attempts, including the first (at least 1)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
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

    /// Un-jittered delay to wait after the given failed attempt (1-based)
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Delay after `attempt` scaled by `jitter`, never above `max_delay`
    pub fn jittered_delay(&self, attempt: u32, jitter: f64) -> Duration {
        let secs = self.base_delay(attempt).as_secs_f64() * jitter;
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Errors for which `is_retryable` returns false are returned immediately.
/// Retryable errors are retried until `max_attempts` is reached, after which
/// the last error is returned.
///
/// # Arguments
/// * `config` - Retry configuration
/// * `operation_name` - Name for logging purposes
/// * `is_retryable` - Classifies an error as transient
/// * `operation` - The async operation to retry
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    is_retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !is_retryable(&e) => return Err(e),
            Err(e) => {
                if attempt >= config.max_attempts.max(1) {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // Add jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = config.jittered_delay(attempt, jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;
            }
        }
    }
}
