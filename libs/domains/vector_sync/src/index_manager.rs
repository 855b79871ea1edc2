//! Index lifecycle: create, deploy, activate and delete vector indexes per
//! entity type and schema version, and keep their metadata records.
//!
//! Lifecycle operations raise on failure; callers of these administrative
//! flows are expected to react.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{VectorError, VectorResult};
use crate::guard::ServiceGuard;
use crate::index_service::{IndexSpec, VectorIndexService};
use crate::models::{
    EntityIndexStatistics, EntityType, IndexMetadata, IndexQuery, IndexStatistics, IndexStatus,
    index_key,
};
use crate::schema::{SchemaRegistry, StructureOverride};
use crate::store::{DocumentStore, Filter, INDEX_COLLECTION, Updates, WriteOp};

/// Options for [`IndexManager::create_index`]
#[derive(Debug, Clone, Default)]
pub struct CreateIndexOptions {
    /// Replace an existing index at the same key
    pub recreate: bool,
    /// Activate the index once it is ready
    pub make_active: bool,
    pub custom_structure: Option<StructureOverride>,
}

/// Failure for one entity type inside [`IndexManager::create_all_indexes`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexCreationFailure {
    pub entity_type: EntityType,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexCreationReport {
    pub created: Vec<IndexMetadata>,
    pub failed: Vec<IndexCreationFailure>,
}

pub struct IndexManager {
    store: Arc<dyn DocumentStore>,
    service: Arc<dyn VectorIndexService>,
    schemas: Arc<SchemaRegistry>,
    guard: Arc<ServiceGuard>,
    environment: String,
    default_schema_version: u32,
}

impl IndexManager {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        service: Arc<dyn VectorIndexService>,
        schemas: Arc<SchemaRegistry>,
        guard: Arc<ServiceGuard>,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            store,
            service,
            schemas,
            guard,
            environment: environment.into(),
            default_schema_version: 1,
        }
    }

    /// Schema version used when an index has to be created on first use
    pub fn with_default_schema_version(mut self, version: u32) -> Self {
        self.default_schema_version = version;
        self
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn index_key(&self, entity_type: EntityType, schema_version: u32) -> String {
        index_key(&self.environment, entity_type, schema_version)
    }

    /// Shared serving endpoint for the environment
    pub fn endpoint_name(&self) -> String {
        format!("{}-vector-endpoint", self.environment)
    }

    /// Deployed index ids only allow letters, digits and underscores
    pub fn deployed_index_id(&self, entity_type: EntityType, schema_version: u32) -> String {
        format!("{}_{}_v{}", self.environment, entity_type.as_key(), schema_version)
            .replace('-', "_")
    }

    #[instrument(skip(self))]
    pub async fn get_index_metadata(
        &self,
        entity_type: EntityType,
        schema_version: u32,
    ) -> VectorResult<Option<IndexMetadata>> {
        let key = self.index_key(entity_type, schema_version);
        match self.store.get(INDEX_COLLECTION, &key).await? {
            Some(document) => Ok(Some(IndexMetadata::from_fields(document.fields)?)),
            None => Ok(None),
        }
    }

    async fn require_metadata(
        &self,
        entity_type: EntityType,
        schema_version: u32,
    ) -> VectorResult<IndexMetadata> {
        self.get_index_metadata(entity_type, schema_version)
            .await?
            .ok_or_else(|| {
                VectorError::NotFound(format!(
                    "Index {}",
                    self.index_key(entity_type, schema_version)
                ))
            })
    }

    /// Index metadata records of this environment matching `query`,
    /// ordered by entity type then schema version
    pub async fn query_indexes(&self, query: &IndexQuery) -> VectorResult<Vec<IndexMetadata>> {
        let mut filter = Filter::all().equals("environment", self.environment.as_str());
        if let Some(entity_type) = query.entity_type {
            filter = filter.equals("entityType", entity_type.to_string());
        }
        if let Some(status) = query.status {
            filter = filter.equals("status", status.to_string());
        }
        if let Some(active) = query.active {
            filter = filter.equals("active", active);
        }
        if let Some(version) = query.schema_version {
            filter = filter.equals("schemaVersion", version);
        }

        let mut records = self
            .store
            .query(INDEX_COLLECTION, filter)
            .await?
            .into_iter()
            .map(|document| IndexMetadata::from_fields(document.fields))
            .collect::<VectorResult<Vec<_>>>()?;
        records.retain(|m| query.matches(m));
        records.sort_by_key(|m| (m.entity_type, m.schema_version));
        Ok(records)
    }

    /// The index currently used for writes and queries of an entity type
    pub async fn get_active_index(&self, entity_type: EntityType) -> VectorResult<Option<IndexMetadata>> {
        let mut active = self
            .query_indexes(&IndexQuery {
                entity_type: Some(entity_type),
                active: Some(true),
                ..Default::default()
            })
            .await?;

        if active.len() > 1 {
            error!(
                entity_type = %entity_type,
                count = active.len(),
                "More than one active index, using the newest schema version"
            );
        }
        Ok(active.pop())
    }

    /// Create the index for an entity type and schema version.
    ///
    /// An existing record is returned unchanged unless `recreate` is set.
    #[instrument(skip(self, options), fields(recreate = options.recreate, make_active = options.make_active))]
    pub async fn create_index(
        &self,
        entity_type: EntityType,
        schema_version: u32,
        options: CreateIndexOptions,
    ) -> VectorResult<IndexMetadata> {
        let key = self.index_key(entity_type, schema_version);
        let existing = self.get_index_metadata(entity_type, schema_version).await?;

        if let Some(ref existing) = existing {
            if !options.recreate {
                debug!(index = %key, "Index already exists");
                return Ok(existing.clone());
            }
        }

        let structure =
            self.schemas
                .resolve(entity_type, schema_version, options.custom_structure.as_ref())?;

        let was_active = existing.as_ref().is_some_and(|m| m.active);
        if let Some(previous) = existing.as_ref().and_then(|m| m.resource_name.clone()) {
            info!(index = %key, resource = %previous, "Recreating index, removing previous resource");
            let service = &self.service;
            if let Err(e) = self
                .guard
                .call("delete_index", || service.delete_index(&previous))
                .await
            {
                warn!(index = %key, error = %e, "Failed to delete previous index resource");
            }
        }

        let now = Utc::now();
        let mut metadata = IndexMetadata {
            index_id: key.clone(),
            resource_name: None,
            entity_type,
            schema_version,
            environment: self.environment.clone(),
            status: IndexStatus::Creating,
            vector_count: 0,
            structure: structure.clone(),
            active: was_active,
            endpoint_id: None,
            deployed_index_id: None,
            error: None,
            created_at: Some(now),
            updated_at: Some(now),
        };
        self.store
            .set(INDEX_COLLECTION, &key, metadata.to_fields()?)
            .await?;

        let spec = IndexSpec {
            name: key.clone(),
            structure,
        };
        let service = &self.service;
        let created = self
            .guard
            .call("create_index", || service.create_index(spec.clone()))
            .await;

        let resource = match created {
            Ok(resource) => resource,
            Err(e) => {
                error!(index = %key, error = %e, "Index creation failed");
                if let Err(mark_err) = self
                    .update_index_status(entity_type, schema_version, IndexStatus::Error, Some(e.to_string()))
                    .await
                {
                    warn!(index = %key, error = %mark_err, "Failed to record index error");
                }
                return Err(e);
            }
        };

        self.store
            .update(
                INDEX_COLLECTION,
                &key,
                Updates::new()
                    .set("status", IndexStatus::Ready.to_string())
                    .set("resourceName", resource.as_str())
                    .server_timestamp("updatedAt"),
            )
            .await?;
        metadata.status = IndexStatus::Ready;
        metadata.resource_name = Some(resource);
        info!(index = %key, "Index ready");

        if options.make_active && !metadata.active {
            self.set_active_index(entity_type, schema_version).await?;
            metadata.active = true;
        }

        Ok(metadata)
    }

    /// Make `schema_version` the single active index of an entity type.
    ///
    /// One atomic batch deactivates every record of the type present when
    /// the batch commits and activates the target, so readers never observe
    /// zero or two active indexes, including records created concurrently.
    #[instrument(skip(self))]
    pub async fn set_active_index(&self, entity_type: EntityType, schema_version: u32) -> VectorResult<()> {
        let records = self.query_indexes(&IndexQuery::for_type(entity_type)).await?;

        let target = records
            .iter()
            .find(|m| m.schema_version == schema_version)
            .ok_or_else(|| {
                VectorError::NotFound(format!(
                    "Index {}",
                    self.index_key(entity_type, schema_version)
                ))
            })?;
        if !matches!(target.status, IndexStatus::Ready | IndexStatus::Updating) {
            return Err(VectorError::InvalidOperation(format!(
                "Index {} is {} and cannot be activated",
                target.index_id, target.status
            )));
        }

        let same_type = Filter::all()
            .equals("environment", self.environment.as_str())
            .equals("entityType", entity_type.to_string())
            .equals("active", true);
        let ops = vec![
            WriteOp::update_where(
                INDEX_COLLECTION,
                same_type,
                Updates::new()
                    .set("active", false)
                    .server_timestamp("updatedAt"),
            ),
            WriteOp::update(
                INDEX_COLLECTION,
                target.index_id.as_str(),
                Updates::new()
                    .set("active", true)
                    .server_timestamp("updatedAt"),
            ),
        ];

        self.store.batch_write(ops).await?;
        info!(entity_type = %entity_type, schema_version, "Active index switched");
        Ok(())
    }

    /// Deploy an index to the environment's shared endpoint
    #[instrument(skip(self))]
    pub async fn deploy_index_to_endpoint(
        &self,
        entity_type: EntityType,
        schema_version: u32,
    ) -> VectorResult<IndexMetadata> {
        let mut metadata = self.require_metadata(entity_type, schema_version).await?;
        let resource = metadata.resource_name.clone().ok_or_else(|| {
            VectorError::InvalidOperation(format!(
                "Index {} has no resource to deploy",
                metadata.index_id
            ))
        })?;
        let deployed_index_id = self.deployed_index_id(entity_type, schema_version);

        let service = &self.service;
        let endpoint_name = self.endpoint_name();
        let endpoint = self
            .guard
            .call("get_or_create_endpoint", || {
                service.get_or_create_endpoint(&endpoint_name)
            })
            .await?;

        if metadata.endpoint_id.as_deref() == Some(endpoint.as_str())
            && metadata.deployed_index_id.as_deref() == Some(deployed_index_id.as_str())
        {
            debug!(index = %metadata.index_id, "Index already deployed");
            return Ok(metadata);
        }

        self.update_index_status(entity_type, schema_version, IndexStatus::Updating, None)
            .await?;

        let deployed = self
            .guard
            .call("deploy_index", || {
                service.deploy_index(&endpoint, &resource, &deployed_index_id)
            })
            .await;

        if let Err(e) = deployed {
            error!(index = %metadata.index_id, error = %e, "Index deployment failed");
            if let Err(mark_err) = self
                .update_index_status(entity_type, schema_version, IndexStatus::Error, Some(e.to_string()))
                .await
            {
                warn!(index = %metadata.index_id, error = %mark_err, "Failed to record deployment error");
            }
            return Err(e);
        }

        self.store
            .update(
                INDEX_COLLECTION,
                &metadata.index_id,
                Updates::new()
                    .set("status", IndexStatus::Ready.to_string())
                    .set("endpointId", endpoint.as_str())
                    .set("deployedIndexId", deployed_index_id.as_str())
                    .delete("error")
                    .server_timestamp("updatedAt"),
            )
            .await?;

        info!(index = %metadata.index_id, endpoint = %endpoint, "Index deployed");
        metadata.status = IndexStatus::Ready;
        metadata.endpoint_id = Some(endpoint);
        metadata.deployed_index_id = Some(deployed_index_id);
        metadata.error = None;
        Ok(metadata)
    }

    /// Delete an inactive index and its metadata record
    #[instrument(skip(self))]
    pub async fn delete_index(&self, entity_type: EntityType, schema_version: u32) -> VectorResult<()> {
        let metadata = self.require_metadata(entity_type, schema_version).await?;
        if metadata.active {
            return Err(VectorError::InvalidOperation(format!(
                "Index {} is active; activate a replacement before deleting it",
                metadata.index_id
            )));
        }

        self.update_index_status(entity_type, schema_version, IndexStatus::Deleting, None)
            .await?;

        if let Some(ref resource) = metadata.resource_name {
            let service = &self.service;
            let deleted = self
                .guard
                .call("delete_index", || service.delete_index(resource))
                .await;
            if let Err(e) = deleted {
                error!(index = %metadata.index_id, error = %e, "Index deletion failed");
                if let Err(mark_err) = self
                    .update_index_status(entity_type, schema_version, IndexStatus::Error, Some(e.to_string()))
                    .await
                {
                    warn!(index = %metadata.index_id, error = %mark_err, "Failed to record deletion error");
                }
                return Err(e);
            }
        }

        self.store.delete(INDEX_COLLECTION, &metadata.index_id).await?;
        info!(index = %metadata.index_id, "Index deleted");
        Ok(())
    }

    /// Create an index for every entity type; failures are logged and skipped
    pub async fn create_all_indexes(
        &self,
        schema_version: u32,
        options: CreateIndexOptions,
    ) -> IndexCreationReport {
        let mut report = IndexCreationReport::default();

        for entity_type in EntityType::ALL {
            match self
                .create_index(entity_type, schema_version, options.clone())
                .await
            {
                Ok(metadata) => report.created.push(metadata),
                Err(e) => {
                    error!(entity_type = %entity_type, schema_version, error = %e, "Skipping index");
                    report.failed.push(IndexCreationFailure {
                        entity_type,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            created = report.created.len(),
            failed = report.failed.len(),
            "Index creation finished"
        );
        report
    }

    /// Active index of an entity type, creating, activating and deploying
    /// one at the default schema version when none exists
    pub async fn ensure_active_index(&self, entity_type: EntityType) -> VectorResult<IndexMetadata> {
        if let Some(active) = self.get_active_index(entity_type).await? {
            if !self.needs_deployment(&active) {
                return Ok(active);
            }
            // Writes do not need a deployment; a failed redeploy is retried on next use.
            return match self.ensure_deployed(active.clone()).await {
                Ok(deployed) => Ok(deployed),
                Err(e) => {
                    warn!(index = %active.index_id, error = %e, "Redeploying active index failed");
                    Ok(active)
                }
            };
        }

        info!(
            entity_type = %entity_type,
            schema_version = self.default_schema_version,
            "No active index, creating one"
        );
        let created = self
            .create_index(
                entity_type,
                self.default_schema_version,
                CreateIndexOptions {
                    make_active: true,
                    ..Default::default()
                },
            )
            .await?;
        if !created.active {
            self.set_active_index(entity_type, created.schema_version)
                .await?;
        }
        let mut deployed = self
            .deploy_index_to_endpoint(entity_type, created.schema_version)
            .await?;
        deployed.active = true;
        Ok(deployed)
    }

    fn needs_deployment(&self, metadata: &IndexMetadata) -> bool {
        !metadata.is_deployed()
            && metadata.resource_name.is_some()
            && matches!(metadata.status, IndexStatus::Ready | IndexStatus::Error)
    }

    /// Deploy `metadata` when it has a resource but no deployment yet
    pub async fn ensure_deployed(&self, metadata: IndexMetadata) -> VectorResult<IndexMetadata> {
        if !self.needs_deployment(&metadata) {
            return Ok(metadata);
        }
        info!(index = %metadata.index_id, "Index is not deployed, deploying");
        let active = metadata.active;
        let mut deployed = self
            .deploy_index_to_endpoint(metadata.entity_type, metadata.schema_version)
            .await?;
        deployed.active = active;
        Ok(deployed)
    }

    pub async fn update_index_status(
        &self,
        entity_type: EntityType,
        schema_version: u32,
        status: IndexStatus,
        error_message: Option<String>,
    ) -> VectorResult<()> {
        let mut updates = Updates::new()
            .set("status", status.to_string())
            .server_timestamp("updatedAt");
        updates = match error_message {
            Some(message) => updates.set("error", message),
            None => updates.delete("error"),
        };
        self.store
            .update(
                INDEX_COLLECTION,
                &self.index_key(entity_type, schema_version),
                updates,
            )
            .await
    }

    /// Add `delta` to the stored vector count, never going below zero.
    /// Returns the new count.
    pub async fn adjust_vector_count(
        &self,
        entity_type: EntityType,
        schema_version: u32,
        delta: i64,
    ) -> VectorResult<u64> {
        let metadata = self.require_metadata(entity_type, schema_version).await?;
        let current = i64::try_from(metadata.vector_count).unwrap_or(i64::MAX);
        let next = current.saturating_add(delta).max(0) as u64;
        self.set_vector_count(entity_type, schema_version, next).await?;
        Ok(next)
    }

    pub async fn set_vector_count(
        &self,
        entity_type: EntityType,
        schema_version: u32,
        count: u64,
    ) -> VectorResult<()> {
        self.store
            .update(
                INDEX_COLLECTION,
                &self.index_key(entity_type, schema_version),
                Updates::new()
                    .set("vectorCount", count)
                    .server_timestamp("updatedAt"),
            )
            .await
    }

    /// Record counts by status, active versions, and stored vs live vector counts
    pub async fn get_index_statistics(
        &self,
        entity_type: Option<EntityType>,
    ) -> VectorResult<IndexStatistics> {
        let records = self
            .query_indexes(&IndexQuery {
                entity_type,
                ..Default::default()
            })
            .await?;

        let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
        for record in &records {
            *by_status.entry(record.status.to_string()).or_default() += 1;
        }

        let types: Vec<EntityType> = match entity_type {
            Some(t) => vec![t],
            None => EntityType::ALL.to_vec(),
        };

        let mut entity_types = Vec::new();
        for t in types {
            let of_type: Vec<&IndexMetadata> = records.iter().filter(|m| m.entity_type == t).collect();
            if of_type.is_empty() && entity_type.is_none() {
                continue;
            }
            let active = of_type.iter().find(|m| m.active);

            let live_vector_count = match active.and_then(|m| m.resource_name.as_deref()) {
                Some(resource) => {
                    let service = &self.service;
                    match self
                        .guard
                        .call("count_datapoints", || service.count_datapoints(resource))
                        .await
                    {
                        Ok(count) => Some(count),
                        Err(e) => {
                            warn!(entity_type = %t, error = %e, "Could not read live vector count");
                            None
                        }
                    }
                }
                None => None,
            };

            entity_types.push(EntityIndexStatistics {
                entity_type: t,
                index_count: of_type.len(),
                active_schema_version: active.map(|m| m.schema_version),
                stored_vector_count: active.map_or(0, |m| m.vector_count),
                live_vector_count,
            });
        }

        Ok(IndexStatistics {
            environment: self.environment.clone(),
            total_indexes: records.len(),
            by_status,
            total_vectors: records.iter().map(|m| m.vector_count).sum(),
            entity_types,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index_service::MockVectorIndexService;
    use crate::memory::{MemoryDocumentStore, MemoryIndexService};
    use crate::schema::IndexStructure;
    use resilience::CircuitBreakerConfig;
    use std::sync::atomic::Ordering;

    fn manager(store: Arc<MemoryDocumentStore>, service: Arc<dyn VectorIndexService>) -> IndexManager {
        IndexManager::new(
            store,
            service,
            Arc::new(SchemaRegistry::with_defaults(4)),
            Arc::new(ServiceGuard::without_retry(
                "vector-index",
                CircuitBreakerConfig::new(),
            )),
            "dev",
        )
    }

    fn setup() -> (Arc<MemoryDocumentStore>, Arc<MemoryIndexService>, IndexManager) {
        let store = Arc::new(MemoryDocumentStore::new());
        let service = Arc::new(MemoryIndexService::new());
        let manager = manager(store.clone(), service.clone());
        (store, service, manager)
    }

    fn active() -> CreateIndexOptions {
        CreateIndexOptions {
            make_active: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_index_is_idempotent() {
        let (store, service, manager) = setup();

        let created = manager
            .create_index(EntityType::Character, 1, CreateIndexOptions::default())
            .await
            .unwrap();
        assert_eq!(created.index_id, "dev-character-v1");
        assert_eq!(created.status, IndexStatus::Ready);
        assert_eq!(created.resource_name.as_deref(), Some("indexes/dev-character-v1"));
        assert!(!created.active);

        let again = manager
            .create_index(EntityType::Character, 1, CreateIndexOptions::default())
            .await
            .unwrap();
        assert_eq!(again.resource_name, created.resource_name);
        assert_eq!(service.calls.create_index.load(Ordering::SeqCst), 1);

        let stored = store.fields(INDEX_COLLECTION, "dev-character-v1").await.unwrap();
        assert_eq!(stored["status"], "READY");
    }

    #[tokio::test]
    async fn test_unknown_schema_version_is_not_found() {
        let (_, service, manager) = setup();
        let err = manager
            .create_index(EntityType::Item, 7, CreateIndexOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VectorError::NotFound(_)));
        assert_eq!(service.calls.total(), 0);
    }

    #[tokio::test]
    async fn test_failed_creation_marks_record_error() {
        let store = Arc::new(MemoryDocumentStore::new());
        let mut service = MockVectorIndexService::new();
        service
            .expect_create_index()
            .times(1)
            .returning(|_| Err(VectorError::Validation("bad structure".to_string())));
        let manager = manager(store.clone(), Arc::new(service));

        let err = manager
            .create_index(EntityType::Quest, 1, CreateIndexOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VectorError::Validation(_)));

        let record = manager
            .get_index_metadata(EntityType::Quest, 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, IndexStatus::Error);
        assert!(record.error.unwrap().contains("bad structure"));
    }

    #[tokio::test]
    async fn test_set_active_index_switches_exclusively() {
        let (_, _, mut manager) = setup();
        let mut registry = SchemaRegistry::with_defaults(4);
        registry
            .register(
                EntityType::Location,
                2,
                IndexStructure::default_for(EntityType::Location, 2, 4),
            )
            .unwrap();
        manager.schemas = Arc::new(registry);

        manager.create_index(EntityType::Location, 1, active()).await.unwrap();
        manager
            .create_index(EntityType::Location, 2, CreateIndexOptions::default())
            .await
            .unwrap();

        manager.set_active_index(EntityType::Location, 2).await.unwrap();

        let records = manager
            .query_indexes(&IndexQuery::for_type(EntityType::Location))
            .await
            .unwrap();
        let active: Vec<u32> = records.iter().filter(|m| m.active).map(|m| m.schema_version).collect();
        assert_eq!(active, vec![2]);
        assert_eq!(
            manager
                .get_active_index(EntityType::Location)
                .await
                .unwrap()
                .unwrap()
                .schema_version,
            2
        );
    }

    #[tokio::test]
    async fn test_set_active_index_failure_changes_nothing() {
        let (store, _, mut manager) = setup();
        let mut registry = SchemaRegistry::with_defaults(4);
        registry
            .register(
                EntityType::Faction,
                2,
                IndexStructure::default_for(EntityType::Faction, 2, 4),
            )
            .unwrap();
        manager.schemas = Arc::new(registry);

        manager.create_index(EntityType::Faction, 1, active()).await.unwrap();
        manager
            .create_index(EntityType::Faction, 2, CreateIndexOptions::default())
            .await
            .unwrap();

        store.fail_next_batch_at(1);
        assert!(manager.set_active_index(EntityType::Faction, 2).await.is_err());

        let active = manager.get_active_index(EntityType::Faction).await.unwrap().unwrap();
        assert_eq!(active.schema_version, 1);
    }

    /// Commits an extra active record just before the next batch write
    struct ConcurrentActivationStore {
        inner: Arc<MemoryDocumentStore>,
        pending: std::sync::Mutex<Option<(String, serde_json::Value)>>,
    }

    #[async_trait::async_trait]
    impl DocumentStore for ConcurrentActivationStore {
        async fn get(&self, collection: &str, id: &str) -> VectorResult<Option<crate::store::Document>> {
            self.inner.get(collection, id).await
        }

        async fn set(&self, collection: &str, id: &str, fields: crate::store::Fields) -> VectorResult<()> {
            self.inner.set(collection, id, fields).await
        }

        async fn update(&self, collection: &str, id: &str, updates: Updates) -> VectorResult<()> {
            self.inner.update(collection, id, updates).await
        }

        async fn delete(&self, collection: &str, id: &str) -> VectorResult<bool> {
            self.inner.delete(collection, id).await
        }

        async fn query(&self, collection: &str, filter: Filter) -> VectorResult<Vec<crate::store::Document>> {
            self.inner.query(collection, filter).await
        }

        async fn batch_write(&self, ops: Vec<WriteOp>) -> VectorResult<()> {
            let pending = self.pending.lock().unwrap().take();
            if let Some((id, record)) = pending {
                self.inner.insert(INDEX_COLLECTION, &id, record).await;
            }
            self.inner.batch_write(ops).await
        }
    }

    #[tokio::test]
    async fn test_set_active_index_deactivates_records_written_concurrently() {
        let store = Arc::new(MemoryDocumentStore::new());
        let service = Arc::new(MemoryIndexService::new());
        let mut registry = SchemaRegistry::with_defaults(4);
        registry
            .register(
                EntityType::Location,
                2,
                IndexStructure::default_for(EntityType::Location, 2, 4),
            )
            .unwrap();
        let mut seeding = manager(store.clone(), service.clone());
        seeding.schemas = Arc::new(registry.clone());
        seeding.create_index(EntityType::Location, 1, active()).await.unwrap();
        seeding
            .create_index(EntityType::Location, 2, CreateIndexOptions::default())
            .await
            .unwrap();

        let mut racing = store.fields(INDEX_COLLECTION, "dev-location-v2").await.unwrap();
        racing.insert("indexId".to_string(), "dev-location-v3".into());
        racing.insert("schemaVersion".to_string(), 3.into());
        racing.insert("active".to_string(), true.into());
        let wrapped = Arc::new(ConcurrentActivationStore {
            inner: store.clone(),
            pending: std::sync::Mutex::new(Some((
                "dev-location-v3".to_string(),
                serde_json::Value::Object(racing),
            ))),
        });
        let manager = IndexManager::new(
            wrapped,
            service,
            Arc::new(registry),
            Arc::new(ServiceGuard::without_retry(
                "vector-index",
                CircuitBreakerConfig::new(),
            )),
            "dev",
        );

        manager.set_active_index(EntityType::Location, 2).await.unwrap();

        let active: Vec<u32> = manager
            .query_indexes(&IndexQuery::for_type(EntityType::Location))
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.active)
            .map(|m| m.schema_version)
            .collect();
        assert_eq!(active, vec![2]);
    }

    #[tokio::test]
    async fn test_set_active_index_requires_record() {
        let (_, _, manager) = setup();
        manager.create_index(EntityType::Note, 1, active()).await.unwrap();

        let err = manager.set_active_index(EntityType::Note, 3).await.unwrap_err();
        assert!(matches!(err, VectorError::NotFound(_)));
        assert!(manager.get_active_index(EntityType::Note).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_active_index_is_rejected_without_service_calls() {
        let (_, service, manager) = setup();
        manager.create_index(EntityType::Session, 1, active()).await.unwrap();
        let before = service.calls.total();

        let err = manager.delete_index(EntityType::Session, 1).await.unwrap_err();
        assert!(matches!(err, VectorError::InvalidOperation(_)));
        assert_eq!(service.calls.total(), before);

        let record = manager.get_index_metadata(EntityType::Session, 1).await.unwrap().unwrap();
        assert_eq!(record.status, IndexStatus::Ready);
    }

    #[tokio::test]
    async fn test_delete_inactive_index_removes_record_and_resource() {
        let (store, service, manager) = setup();
        manager
            .create_index(EntityType::Event, 1, CreateIndexOptions::default())
            .await
            .unwrap();

        manager.delete_index(EntityType::Event, 1).await.unwrap();

        assert!(!service.index_exists("indexes/dev-event-v1"));
        assert_eq!(store.count(INDEX_COLLECTION).await, 0);
    }

    #[tokio::test]
    async fn test_deploy_records_endpoint() {
        let (_, service, manager) = setup();
        manager.create_index(EntityType::Character, 1, active()).await.unwrap();

        let deployed = manager
            .deploy_index_to_endpoint(EntityType::Character, 1)
            .await
            .unwrap();
        assert_eq!(deployed.status, IndexStatus::Ready);
        assert_eq!(deployed.endpoint_id.as_deref(), Some("endpoints/dev-vector-endpoint"));
        assert_eq!(deployed.deployed_index_id.as_deref(), Some("dev_character_v1"));
        assert_eq!(
            service.deployment("indexes/dev-character-v1"),
            Some((
                "endpoints/dev-vector-endpoint".to_string(),
                "dev_character_v1".to_string()
            ))
        );

        // second deploy only resolves the endpoint
        manager
            .deploy_index_to_endpoint(EntityType::Character, 1)
            .await
            .unwrap();
        assert_eq!(service.calls.deploy.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ensure_active_index_creates_activates_and_deploys() {
        let (_, service, manager) = setup();

        let index = manager.ensure_active_index(EntityType::Item).await.unwrap();
        assert!(index.active);
        assert!(index.deployed_index_id.is_some());

        let again = manager.ensure_active_index(EntityType::Item).await.unwrap();
        assert_eq!(again.index_id, index.index_id);
        assert_eq!(service.calls.create_index.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ensure_active_index_redeploys_after_failed_deploy() {
        let (_, service, manager) = setup();
        service.fail_next_deploys(1);

        let err = manager.ensure_active_index(EntityType::Quest).await.unwrap_err();
        assert!(matches!(err, VectorError::ExternalService { .. }));
        let record = manager.get_active_index(EntityType::Quest).await.unwrap().unwrap();
        assert_eq!(record.status, IndexStatus::Error);
        assert!(!record.is_deployed());

        let index = manager.ensure_active_index(EntityType::Quest).await.unwrap();
        assert!(index.active);
        assert!(index.is_deployed());
        assert_eq!(index.status, IndexStatus::Ready);
        assert_eq!(service.calls.create_index.load(Ordering::SeqCst), 1);
        assert_eq!(service.calls.deploy.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_ensure_active_index_redeploys_recreated_index() {
        let (_, service, manager) = setup();
        manager.ensure_active_index(EntityType::Session).await.unwrap();
        manager
            .create_index(
                EntityType::Session,
                1,
                CreateIndexOptions {
                    recreate: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let record = manager.get_active_index(EntityType::Session).await.unwrap().unwrap();
        assert!(!record.is_deployed());

        let index = manager.ensure_active_index(EntityType::Session).await.unwrap();
        assert!(index.is_deployed());
        assert_eq!(service.calls.deploy.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_vector_count_never_negative() {
        let (_, _, manager) = setup();
        manager
            .create_index(EntityType::Item, 1, CreateIndexOptions::default())
            .await
            .unwrap();

        assert_eq!(manager.adjust_vector_count(EntityType::Item, 1, 3).await.unwrap(), 3);
        assert_eq!(manager.adjust_vector_count(EntityType::Item, 1, -5).await.unwrap(), 0);
        let record = manager.get_index_metadata(EntityType::Item, 1).await.unwrap().unwrap();
        assert_eq!(record.vector_count, 0);
    }

    #[tokio::test]
    async fn test_create_all_indexes_skips_failures() {
        let store = Arc::new(MemoryDocumentStore::new());
        let service = Arc::new(MemoryIndexService::new());
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                EntityType::Character,
                1,
                IndexStructure::default_for(EntityType::Character, 1, 4),
            )
            .unwrap();
        let mut manager = manager(store, service);
        manager.schemas = Arc::new(registry);

        let report = manager.create_all_indexes(1, CreateIndexOptions::default()).await;
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.failed.len(), EntityType::ALL.len() - 1);
    }

    #[tokio::test]
    async fn test_statistics() {
        let (_, _, manager) = setup();
        manager.create_index(EntityType::Character, 1, active()).await.unwrap();
        manager
            .create_index(EntityType::Location, 1, CreateIndexOptions::default())
            .await
            .unwrap();
        manager.adjust_vector_count(EntityType::Character, 1, 2).await.unwrap();

        let stats = manager.get_index_statistics(None).await.unwrap();
        assert_eq!(stats.total_indexes, 2);
        assert_eq!(stats.by_status.get("READY"), Some(&2));
        assert_eq!(stats.total_vectors, 2);

        let character = &stats.entity_types[0];
        assert_eq!(character.entity_type, EntityType::Character);
        assert_eq!(character.active_schema_version, Some(1));
        assert_eq!(character.stored_vector_count, 2);
        assert_eq!(character.live_vector_count, Some(0));

        let location = manager
            .get_index_statistics(Some(EntityType::Location))
            .await
            .unwrap();
        assert_eq!(location.entity_types[0].active_schema_version, None);
    }
}
