use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{EmbeddingProvider, EmbeddingResult};
use crate::cache::TtlCache;
use crate::error::{VectorError, VectorResult};

/// Embeddings keyed by (model, text)
pub type EmbeddingCache = TtlCache<(String, String), EmbeddingResult>;

/// Provider wrapper that serves repeated texts from an injected cache
pub struct CachingEmbeddingProvider<P> {
    inner: P,
    cache: Arc<EmbeddingCache>,
}

impl<P: EmbeddingProvider> CachingEmbeddingProvider<P> {
    pub fn new(inner: P, cache: Arc<EmbeddingCache>) -> Self {
        Self { inner, cache }
    }

    fn key(model: &str, text: &str) -> (String, String) {
        (model.to_string(), text.to_string())
    }
}

#[async_trait]
impl<P: EmbeddingProvider> EmbeddingProvider for CachingEmbeddingProvider<P> {
    fn provider_name(&self) -> &'static str {
        self.inner.provider_name()
    }

    async fn embed(&self, model: &str, text: &str) -> VectorResult<EmbeddingResult> {
        let key = Self::key(model, text);
        if let Some(hit) = self.cache.get(&key) {
            debug!(model, "Embedding cache hit");
            return Ok(hit);
        }

        let result = self.inner.embed(model, text).await?;
        self.cache.insert(key, result.clone());
        Ok(result)
    }

    async fn embed_batch(&self, model: &str, texts: &[String]) -> VectorResult<Vec<EmbeddingResult>> {
        let mut results: Vec<Option<EmbeddingResult>> = texts
            .iter()
            .map(|text| self.cache.get(&Self::key(model, text)))
            .collect();

        let misses: Vec<String> = texts
            .iter()
            .zip(&results)
            .filter(|(_, hit)| hit.is_none())
            .map(|(text, _)| text.clone())
            .collect();

        if !misses.is_empty() {
            debug!(model, hits = texts.len() - misses.len(), misses = misses.len(), "Embedding batch");
            let fetched = self.inner.embed_batch(model, &misses).await?;
            if fetched.len() != misses.len() {
                return Err(VectorError::external(
                    self.inner.provider_name(),
                    format!("Expected {} embeddings, got {}", misses.len(), fetched.len()),
                ));
            }

            let mut fetched = misses.into_iter().zip(fetched);
            for slot in results.iter_mut().filter(|slot| slot.is_none()) {
                if let Some((text, result)) = fetched.next() {
                    self.cache.insert(Self::key(model, &text), result.clone());
                    *slot = Some(result);
                }
            }
        }

        Ok(results.into_iter().flatten().collect())
    }
}
