//! Retry utilities with exponential backoff and jitter.
//!
//! A [`RetryPolicy`] is a plain value describing how many attempts an operation
//! gets and how long to wait between them. Components receive the policy they
//! should use through [`crate::config::ControllerConfig`] and hand it to one of
//! the generic helpers here.
//!
//! # Example
//!
//! ```ignore
//! use cacheworkerset::retry::{retry_on, RetryPolicy};
//!
//! let pod = retry_on(
//!     &RetryPolicy::conflict(),
//!     "replace_pod",
//!     Error::is_conflict,
//!     || async { client.replace_pod("default", &pod).await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Backoff schedule for operations that may fail transiently.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier applied to the delay after every failed attempt
    pub backoff_multiplier: f64,
    /// Upper bound of the random fraction added to each delay
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Create a policy that retries forever (infinite attempts)
    pub fn infinite() -> Self {
        Self::default()
    }

    /// Schedule used when writing identity and storage fixes back to a pod:
    /// 4 attempts starting at 100ms, growing by 1.5x with 10% jitter.
    pub fn pod_update() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 1.5,
            jitter: 0.1,
        }
    }

    /// Schedule used for read-modify-write cycles that lost an
    /// optimistic-concurrency race: 5 quick attempts 10ms apart.
    pub fn conflict() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 1.0,
            jitter: 0.1,
        }
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(0.0..self.jitter);
        Duration::from_secs_f64(delay.as_secs_f64() * factor)
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Every error is considered transient. Retries until success or until
/// `max_attempts` is exhausted, returning the last error in that case.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_on(policy, operation_name, |_: &E| true, operation).await
}

/// Execute an async operation, retrying only errors accepted by `should_retry`.
///
/// Errors rejected by the predicate are returned immediately without sleeping.
pub async fn retry_on<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = policy.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !should_retry(&e) => return Err(e),
            Err(e) => {
                if policy.exhausted(attempt) {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let jittered_delay = policy.jittered(delay);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;
                delay = policy.next_delay(delay);
            }
        }
    }
}
