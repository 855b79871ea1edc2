use async_trait::async_trait;

use super::EmbeddingResult;
use crate::error::VectorResult;

/// Text embedding service
///
/// Implementations fail with an external-service error when the backend
/// returns no predictions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Name used in logs and circuit breaker names
    fn provider_name(&self) -> &'static str;

    /// Generate embedding for a single text
    async fn embed(&self, model: &str, text: &str) -> VectorResult<EmbeddingResult>;

    /// Generate embeddings for multiple texts, in input order
    async fn embed_batch(&self, model: &str, texts: &[String]) -> VectorResult<Vec<EmbeddingResult>>;
}
