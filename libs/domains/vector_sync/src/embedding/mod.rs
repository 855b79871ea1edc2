mod caching;
mod provider;
mod vertexai;

pub use caching::{CachingEmbeddingProvider, EmbeddingCache};
pub use provider::EmbeddingProvider;
#[cfg(test)]
pub use provider::MockEmbeddingProvider;
pub use vertexai::{TokenCache, VertexAIConfig, VertexAIProvider};

use serde::{Deserialize, Serialize};

/// Default Vertex AI embedding model (768 dimensions)
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-004";

/// Embedding generated for one text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResult {
    pub values: Vec<f32>,
    pub dimension: u32,
    pub tokens_used: u32,
}

impl EmbeddingResult {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            dimension: values.len() as u32,
            values,
            tokens_used: 0,
        }
    }
}
