use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Retry policy for calls into external services
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Delay before the second attempt in milliseconds
    pub initial_delay_ms: u64,

    /// Upper bound for a single delay in milliseconds
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff (typically 2.0)
    pub backoff_multiplier: f64,

    /// Whether to add jitter to prevent thundering herd
    pub use_jitter: bool,
}

impl RetryConfig {
    /// Defaults: 3 attempts, 500ms initial delay doubling up to 10s, with jitter
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay_ms: u64) -> Self {
        self.initial_delay_ms = delay_ms;
        self
    }

    pub fn with_max_delay(mut self, delay_ms: u64) -> Self {
        self.max_delay_ms = delay_ms;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Backoff delay (before jitter) after the given failed attempt, 1-based.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        (delay as u64).min(self.max_delay_ms)
    }

    fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let base = self.base_delay_for_attempt(attempt);
        if self.use_jitter {
            apply_jitter(base).min(self.max_delay_ms.max(base))
        } else {
            base
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

/// Retry an async operation with exponential backoff while `is_retryable`
/// accepts the error.
///
/// Non-retryable errors and exhausted attempts both return the last error and
/// log it.
///
/// # Example
/// ```ignore
/// let config = RetryConfig::new().with_max_attempts(5);
/// let result = retry_with_backoff(
///     "upsert_datapoints",
///     || async { client.upsert(points.clone()).await },
///     &config,
///     |e: &ClientError| e.is_transient(),
/// )
/// .await?;
/// ```
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    operation_name: &str,
    mut operation: F,
    config: &RetryConfig,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        operation = operation_name,
                        attempt, "Operation succeeded after retries"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if !is_retryable(&e) {
                    warn!(
                        operation = operation_name,
                        attempt,
                        error = %e,
                        "Operation failed with non-retryable error"
                    );
                    return Err(e);
                }

                if attempt >= max_attempts {
                    warn!(
                        operation = operation_name,
                        attempts = attempt,
                        error = %e,
                        "Operation failed after exhausting retries"
                    );
                    return Err(e);
                }

                let delay = config.delay_for_attempt(attempt);
                debug!(
                    operation = operation_name,
                    attempt,
                    max_attempts,
                    delay_ms = delay,
                    error = %e,
                    "Operation failed, retrying"
                );

                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
    }
}

/// [`retry_with_backoff`] for error types implementing [`Retryable`].
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    operation: F,
    config: &RetryConfig,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display + Retryable,
{
    retry_with_backoff(operation_name, operation, config, |e: &E| e.is_retryable()).await
}

/// Add up to 50% of the delay on top of it.
fn apply_jitter(delay: u64) -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::BuildHasher;

    let random_factor =
        (RandomState::new().hash_one(std::time::SystemTime::now()) % 50) as f64 / 100.0;

    delay + (delay as f64 * random_factor) as u64
}
