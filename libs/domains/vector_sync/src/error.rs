use resilience::{CircuitError, Retryable, is_transient_message};
use strum::Display;
use thiserror::Error;

/// Error taxonomy shared by every component of the sync subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Validation,
    Authentication,
    Authorization,
    NotFound,
    Conflict,
    ExternalService,
    RateLimit,
    Timeout,
    Configuration,
    Internal,
}

impl ErrorCategory {
    /// Only failures of an external dependency are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::ExternalService | ErrorCategory::RateLimit | ErrorCategory::Timeout
        )
    }
}

#[derive(Debug, Error)]
pub enum VectorError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Not authorized: {0}")]
    Authorization(String),

    #[error("{service} error: {message}")]
    ExternalService { service: String, message: String },

    #[error("Rate limited by {0}")]
    RateLimited(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Circuit open for {0}")]
    CircuitOpen(String),

    #[error("Document store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type VectorResult<T> = Result<T, VectorError>;

impl VectorError {
    pub fn external(service: impl Into<String>, message: impl Into<String>) -> Self {
        VectorError::ExternalService {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            VectorError::NotFound(_) => ErrorCategory::NotFound,
            VectorError::InvalidOperation(_) => ErrorCategory::Conflict,
            VectorError::Validation(_) => ErrorCategory::Validation,
            VectorError::Authentication(_) => ErrorCategory::Authentication,
            VectorError::Authorization(_) => ErrorCategory::Authorization,
            VectorError::ExternalService { .. } | VectorError::CircuitOpen(_) => {
                ErrorCategory::ExternalService
            }
            VectorError::RateLimited(_) => ErrorCategory::RateLimit,
            VectorError::Timeout(_) => ErrorCategory::Timeout,
            VectorError::Config(_) => ErrorCategory::Configuration,
            VectorError::Store(_) | VectorError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Retryable categories, plus foreign errors whose message looks transient.
    ///
    /// An open circuit is never retried: the breaker exists to fail fast.
    pub fn is_retryable(&self) -> bool {
        match self {
            VectorError::CircuitOpen(_) => false,
            VectorError::Validation(_)
            | VectorError::Authentication(_)
            | VectorError::Authorization(_) => false,
            other if other.category().is_retryable() => true,
            VectorError::Store(message) | VectorError::Internal(message) => {
                is_transient_message(message)
            }
            _ => false,
        }
    }
}

impl Retryable for VectorError {
    fn is_retryable(&self) -> bool {
        VectorError::is_retryable(self)
    }
}

impl From<CircuitError<VectorError>> for VectorError {
    fn from(err: CircuitError<VectorError>) -> Self {
        err.into_inner_or(VectorError::CircuitOpen)
    }
}

impl From<reqwest::Error> for VectorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            VectorError::Timeout(err.to_string())
        } else {
            VectorError::external("embedding", err.to_string())
        }
    }
}

impl From<qdrant_client::QdrantError> for VectorError {
    fn from(err: qdrant_client::QdrantError) -> Self {
        VectorError::external("qdrant", err.to_string())
    }
}

impl From<mongodb::error::Error> for VectorError {
    fn from(err: mongodb::error::Error) -> Self {
        VectorError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for VectorError {
    fn from(err: serde_json::Error) -> Self {
        VectorError::Internal(format!("JSON error: {}", err))
    }
}

impl From<core_config::ConfigError> for VectorError {
    fn from(err: core_config::ConfigError) -> Self {
        VectorError::Config(err.to_string())
    }
}
