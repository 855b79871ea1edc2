//! Resilience primitives for calls into external services.
//!
//! - **Circuit breaker**: fails fast after repeated failures and lets a single
//!   probe through once the cooldown has elapsed
//! - **Retry**: exponential backoff with jitter, driven by an error classifier
//! - **Classification**: message patterns for transient failures reported by
//!   foreign clients
//!
//! Retries are applied above the breaker, so a retried operation passes
//! through the breaker on every attempt:
//!
//! ```rust,ignore
//! use resilience::{CircuitBreaker, CircuitBreakerConfig, RetryConfig, retry_with_backoff};
//!
//! let breaker = CircuitBreaker::new("embedding", CircuitBreakerConfig::default());
//! let policy = RetryConfig::new().with_max_attempts(3);
//!
//! let embedding = retry_with_backoff(
//!     "embed",
//!     || breaker.call(|| provider.embed(text)),
//!     &policy,
//!     |e| !e.is_open(),
//! )
//! .await?;
//! ```

pub mod circuit_breaker;
pub mod classify;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState};
pub use classify::is_transient_message;
pub use retry::{RetryConfig, Retryable, retry, retry_with_backoff};
