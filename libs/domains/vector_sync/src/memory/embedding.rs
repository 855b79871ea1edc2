use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::embedding::{EmbeddingProvider, EmbeddingResult};
use crate::error::{VectorError, VectorResult};

/// Deterministic embedding provider for tests and local runs.
///
/// Identical texts produce identical unit vectors.
#[derive(Debug)]
pub struct StaticEmbeddingProvider {
    dimension: usize,
    calls: AtomicUsize,
    unavailable: AtomicBool,
    failing_patterns: Mutex<Vec<String>>,
}

impl StaticEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            calls: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
            failing_patterns: Mutex::new(Vec::new()),
        }
    }

    /// Texts embedded so far, batch members counted individually
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail any text containing `pattern`
    pub fn fail_when_text_contains(&self, pattern: impl Into<String>) {
        self.patterns().push(pattern.into());
    }

    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut values: Vec<f32> = (0..self.dimension)
            .map(|i| {
                let mut hasher = DefaultHasher::new();
                text.hash(&mut hasher);
                i.hash(&mut hasher);
                (hasher.finish() % 2000) as f32 / 1000.0 - 1.0
            })
            .collect();
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            values.iter_mut().for_each(|v| *v /= norm);
        }
        values
    }

    fn patterns(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.failing_patterns
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn embed_one(&self, text: &str) -> VectorResult<EmbeddingResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(VectorError::external("static-embedding", "service unavailable"));
        }
        if self.patterns().iter().any(|p| text.contains(p.as_str())) {
            return Err(VectorError::external("static-embedding", "No predictions returned"));
        }
        Ok(EmbeddingResult {
            values: self.vector_for(text),
            dimension: self.dimension as u32,
            tokens_used: text.split_whitespace().count() as u32,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for StaticEmbeddingProvider {
    fn provider_name(&self) -> &'static str {
        "static-embedding"
    }

    async fn embed(&self, _model: &str, text: &str) -> VectorResult<EmbeddingResult> {
        self.embed_one(text)
    }

    async fn embed_batch(&self, _model: &str, texts: &[String]) -> VectorResult<Vec<EmbeddingResult>> {
        texts.iter().map(|text| self.embed_one(text)).collect()
    }
}
