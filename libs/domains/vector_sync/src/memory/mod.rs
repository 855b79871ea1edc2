//! In-memory collaborators with call counters and failure injection.
//!
//! Used by unit and integration tests.

mod document_store;
mod embedding;
mod index_service;

pub use document_store::MemoryDocumentStore;
pub use embedding::StaticEmbeddingProvider;
pub use index_service::{IndexServiceCalls, MemoryIndexService};
