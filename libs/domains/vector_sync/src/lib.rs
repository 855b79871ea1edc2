//! Vector Sync Domain Library
//!
//! Keeps campaign entities stored in a document database consistent with
//! their embeddings in an external vector index.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────┐      ┌──────────────┐
//! │ EntitySynchronizer │─────▶│ Embedding    │  (guarded)
//! └─────────┬──────────┘      │ Provider     │
//!           │                 └──────────────┘
//! ┌─────────▼──────────┐      ┌──────────────┐
//! │  VectorOperations  │─────▶│ VectorIndex  │  (guarded)
//! └─────────┬──────────┘      │ Service      │
//!           │                 └──────▲───────┘
//! ┌─────────▼──────────┐             │
//! │    IndexManager    │─────────────┘
//! │  + SchemaRegistry  │
//! └─────────┬──────────┘
//!           │
//! ┌─────────▼──────────┐      ┌──────────────┐
//! │   DocumentStore    │◀─────│  Reconciler  │
//! └────────────────────┘      └──────────────┘
//! ```
//!
//! # Features
//!
//! - **Entity sync**: text extraction, embedding and vector storage with the
//!   sync state (`vectorStatus`, `vectorId`, ...) recorded on each entity
//! - **Index lifecycle**: versioned index structures, exactly one active index
//!   per entity type, switched atomically
//! - **Resilience**: circuit breaker and retry around every external call
//! - **Reconciliation**: missing, orphaned and stale vectors, with optional repair
//!
//! # Usage
//!
//! ```rust,no_run
//! use domain_vector_sync::{
//!     EntityType, MongoDocumentStore, QdrantConfig, QdrantIndexService, SyncConfig,
//!     SyncOptions, TtlCache, VectorSyncService, VertexAIConfig, VertexAIProvider,
//! };
//! use core_config::{FromEnv, mongodb::MongoConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MongoDocumentStore::connect(&MongoConfig::from_env()?).await?;
//! let index = QdrantIndexService::new(&QdrantConfig::from_env()?)?;
//! let tokens = Arc::new(TtlCache::new(Duration::from_secs(3300), 4));
//! let embeddings = VertexAIProvider::new(VertexAIConfig::from_env()?, tokens)?;
//!
//! let service = VectorSyncService::new(
//!     SyncConfig::from_env()?,
//!     Arc::new(store),
//!     Arc::new(index),
//!     Arc::new(embeddings),
//! )?;
//!
//! let result = service
//!     .synchronizer()
//!     .sync_entity("c-42", EntityType::Character, SyncOptions::default())
//!     .await?;
//! println!("synced: {}", result.success);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod embedding;
pub mod error;
pub mod guard;
pub mod index_manager;
pub mod index_service;
pub mod memory;
pub mod models;
pub mod operations;
pub mod reconciler;
pub mod schema;
pub mod service;
pub mod store;
pub mod synchronizer;
pub mod text;

// Re-export commonly used types
pub use cache::TtlCache;
pub use config::SyncConfig;
pub use embedding::{
    CachingEmbeddingProvider, EmbeddingProvider, EmbeddingResult, VertexAIConfig,
    VertexAIProvider,
};
pub use error::{ErrorCategory, VectorError, VectorResult};
pub use guard::ServiceGuard;
pub use index_manager::{CreateIndexOptions, IndexCreationReport, IndexManager};
pub use index_service::{QdrantConfig, QdrantIndexService, VectorIndexService};
pub use models::{
    BatchOperationResult, BulkSyncOptions, Entity, EntityRef, EntityType, IndexMetadata,
    IndexQuery, IndexStatistics, IndexStatus, SyncOptions, SyncResult, SyncSummary,
    VectorMetadata, VectorStatus,
};
pub use operations::{FindOptions, SimilarVector, StoreOptions, VectorInput, VectorOperations};
pub use reconciler::{ReconciliationReport, Reconciler};
pub use schema::{IndexStructure, SchemaRegistry, StructureOverride};
pub use service::VectorSyncService;
pub use store::{DocumentStore, MongoDocumentStore};
pub use synchronizer::{EntityEvent, EntitySynchronizer, EventOutcome};
