use std::future::Future;

use resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryConfig, retry_with_backoff};

use crate::error::{VectorError, VectorResult};

/// Circuit breaker plus retry policy guarding one external service.
///
/// Retries run above the breaker, so an open circuit surfaces as
/// [`VectorError::CircuitOpen`] and is not retried.
#[derive(Debug)]
pub struct ServiceGuard {
    breaker: CircuitBreaker,
    retry: RetryConfig,
}

impl ServiceGuard {
    pub fn new(name: impl Into<String>, breaker: CircuitBreakerConfig, retry: RetryConfig) -> Self {
        Self {
            breaker: CircuitBreaker::new(name, breaker),
            retry,
        }
    }

    /// Guard without retries, for tests and one-shot admin commands
    pub fn without_retry(name: impl Into<String>, breaker: CircuitBreakerConfig) -> Self {
        Self::new(name, breaker, RetryConfig::no_retry())
    }

    pub fn name(&self) -> &str {
        self.breaker.name()
    }

    pub fn state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run `operation` through the breaker, retrying retryable failures
    pub async fn call<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> VectorResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = VectorResult<T>>,
    {
        let breaker = &self.breaker;
        retry_with_backoff(
            operation_name,
            || {
                let attempt = operation();
                async move { breaker.call(|| attempt).await.map_err(VectorError::from) }
            },
            &self.retry,
            VectorError::is_retryable,
        )
        .await
    }
}
