use std::sync::Arc;

use tracing::info;

use crate::config::SyncConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::VectorResult;
use crate::guard::ServiceGuard;
use crate::index_manager::IndexManager;
use crate::index_service::VectorIndexService;
use crate::models::EntityType;
use crate::operations::VectorOperations;
use crate::reconciler::Reconciler;
use crate::schema::{IndexStructure, SchemaRegistry};
use crate::store::DocumentStore;
use crate::synchronizer::EntitySynchronizer;

/// The sync subsystem wired from one configuration.
///
/// The vector-index service guard is shared by the lifecycle manager,
/// vector operations and the reconciler; the embedding service has its own.
pub struct VectorSyncService {
    config: SyncConfig,
    manager: Arc<IndexManager>,
    operations: Arc<VectorOperations>,
    synchronizer: Arc<EntitySynchronizer>,
    reconciler: Reconciler,
}

impl VectorSyncService {
    /// Wire with schema v1 for every entity type, plus the configured
    /// default schema version when it differs
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn DocumentStore>,
        index_service: Arc<dyn VectorIndexService>,
        embeddings: Arc<dyn EmbeddingProvider>,
    ) -> VectorResult<Self> {
        let mut schemas = SchemaRegistry::with_defaults(config.dimension);
        if config.schema_version != 1 {
            for entity_type in EntityType::ALL {
                schemas.register(
                    entity_type,
                    config.schema_version,
                    IndexStructure::default_for(entity_type, config.schema_version, config.dimension),
                )?;
            }
        }
        Ok(Self::with_schemas(config, schemas, store, index_service, embeddings))
    }

    pub fn with_schemas(
        config: SyncConfig,
        schemas: SchemaRegistry,
        store: Arc<dyn DocumentStore>,
        index_service: Arc<dyn VectorIndexService>,
        embeddings: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        let index_guard = Arc::new(ServiceGuard::new(
            "vector-index",
            config.breaker_config(),
            config.retry_config(),
        ));
        let embedding_guard = Arc::new(ServiceGuard::new(
            embeddings.provider_name(),
            config.breaker_config(),
            config.retry_config(),
        ));

        let manager = Arc::new(
            IndexManager::new(
                store.clone(),
                index_service.clone(),
                Arc::new(schemas),
                index_guard.clone(),
                config.environment.as_str(),
            )
            .with_default_schema_version(config.schema_version),
        );
        let operations = Arc::new(VectorOperations::new(
            manager.clone(),
            index_service.clone(),
            index_guard.clone(),
        ));
        let synchronizer = Arc::new(
            EntitySynchronizer::new(
                store.clone(),
                embeddings,
                operations.clone(),
                embedding_guard,
                config.embedding_model.as_str(),
            )
            .with_concurrency(config.concurrency),
        );
        let reconciler = Reconciler::new(
            store,
            manager.clone(),
            index_service,
            index_guard,
            operations.clone(),
            synchronizer.clone(),
        );

        info!(
            environment = %config.environment,
            model = %config.embedding_model,
            dimension = config.dimension,
            schema_version = config.schema_version,
            "Vector sync service ready"
        );

        Self {
            config,
            manager,
            operations,
            synchronizer,
            reconciler,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn indexes(&self) -> &IndexManager {
        &self.manager
    }

    pub fn operations(&self) -> &VectorOperations {
        &self.operations
    }

    pub fn synchronizer(&self) -> &EntitySynchronizer {
        &self.synchronizer
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }
}
