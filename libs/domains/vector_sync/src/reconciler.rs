//! Drift detection between entity sync state and the vectors an index holds.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::error::{VectorError, VectorResult};
use crate::guard::ServiceGuard;
use crate::index_manager::IndexManager;
use crate::index_service::VectorIndexService;
use crate::models::{Entity, EntityRef, EntityType, SyncOptions, VectorStatus};
use crate::operations::VectorOperations;
use crate::store::{DocumentStore, Filter};
use crate::synchronizer::{EMPTY_TEXT_ERROR, EntitySynchronizer};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub entity_type: EntityType,
    pub index_key: String,
    pub entities_checked: usize,
    pub vectors_in_index: usize,
    /// Synced entities whose vector is not in the active index
    pub missing_vectors: Vec<String>,
    /// Vectors no entity references
    pub orphaned_vectors: Vec<String>,
    /// Entities that are not COMPLETED
    pub unsynced_entities: Vec<String>,
    /// Entities that failed for lack of text; terminal until their text changes
    pub no_content_entities: Vec<String>,
    /// Synced entities whose vector belongs to another schema version
    pub stale_schema_entities: Vec<String>,
    pub repaired: usize,
    pub timestamp: DateTime<Utc>,
}

impl ReconciliationReport {
    /// Entities without text content do not count as drift
    pub fn is_consistent(&self) -> bool {
        self.missing_vectors.is_empty()
            && self.orphaned_vectors.is_empty()
            && self.unsynced_entities.is_empty()
            && self.stale_schema_entities.is_empty()
    }
}

fn is_without_content(entity: &Entity) -> bool {
    entity.sync.vector_status == Some(VectorStatus::Failed)
        && entity.sync.vector_error.as_deref() == Some(EMPTY_TEXT_ERROR)
}

pub struct Reconciler {
    store: Arc<dyn DocumentStore>,
    manager: Arc<IndexManager>,
    service: Arc<dyn VectorIndexService>,
    guard: Arc<ServiceGuard>,
    operations: Arc<VectorOperations>,
    synchronizer: Arc<EntitySynchronizer>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        manager: Arc<IndexManager>,
        service: Arc<dyn VectorIndexService>,
        guard: Arc<ServiceGuard>,
        operations: Arc<VectorOperations>,
        synchronizer: Arc<EntitySynchronizer>,
    ) -> Self {
        Self {
            store,
            manager,
            service,
            guard,
            operations,
            synchronizer,
        }
    }

    /// Compare one entity type against its active index.
    ///
    /// With `repair`, drifting entities are force-resynced and orphaned
    /// vectors removed.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, entity_type: EntityType, repair: bool) -> VectorResult<ReconciliationReport> {
        let index = self
            .manager
            .get_active_index(entity_type)
            .await?
            .ok_or_else(|| VectorError::NotFound(format!("No active index for {}", entity_type.as_key())))?;
        let resource = index.resource_name.clone().ok_or_else(|| {
            VectorError::InvalidOperation(format!("Index {} has no resource yet", index.index_id))
        })?;

        let service = &self.service;
        let vector_ids: HashSet<String> = self
            .guard
            .call("list_datapoint_ids", || service.list_datapoint_ids(&resource))
            .await?
            .into_iter()
            .collect();

        let entities: Vec<Entity> = self
            .store
            .query(entity_type.collection(), Filter::all())
            .await?
            .into_iter()
            .map(|document| Entity::new(document.id, entity_type, document.fields))
            .collect();

        let mut report = ReconciliationReport {
            entity_type,
            index_key: index.index_id.clone(),
            entities_checked: entities.len(),
            vectors_in_index: vector_ids.len(),
            missing_vectors: Vec::new(),
            orphaned_vectors: Vec::new(),
            unsynced_entities: Vec::new(),
            no_content_entities: Vec::new(),
            stale_schema_entities: Vec::new(),
            repaired: 0,
            timestamp: Utc::now(),
        };

        let mut referenced: HashSet<&str> = HashSet::new();
        for entity in &entities {
            if let Some(ref vector_id) = entity.sync.vector_id {
                referenced.insert(vector_id.as_str());
            }

            if is_without_content(entity) {
                report.no_content_entities.push(entity.id.clone());
            } else if !entity.sync.is_synced() {
                report.unsynced_entities.push(entity.id.clone());
            } else if entity.sync.schema_version != Some(index.schema_version) {
                report.stale_schema_entities.push(entity.id.clone());
            } else if !entity
                .sync
                .vector_id
                .as_ref()
                .is_some_and(|id| vector_ids.contains(id))
            {
                report.missing_vectors.push(entity.id.clone());
            }
        }

        report.orphaned_vectors = vector_ids
            .iter()
            .filter(|id| !referenced.contains(id.as_str()))
            .cloned()
            .collect();
        report.orphaned_vectors.sort();

        info!(
            index = %report.index_key,
            entities = report.entities_checked,
            vectors = report.vectors_in_index,
            missing = report.missing_vectors.len(),
            orphaned = report.orphaned_vectors.len(),
            unsynced = report.unsynced_entities.len(),
            stale = report.stale_schema_entities.len(),
            no_content = report.no_content_entities.len(),
            "Reconciliation finished"
        );

        if repair && !report.is_consistent() {
            report.repaired = self.repair(&report, index.schema_version).await;
            info!(index = %report.index_key, repaired = report.repaired, "Drift repaired");
        }

        Ok(report)
    }

    async fn repair(&self, report: &ReconciliationReport, schema_version: u32) -> usize {
        let entity_type = report.entity_type;
        let mut repaired = 0;

        let resync: Vec<EntityRef> = report
            .missing_vectors
            .iter()
            .chain(&report.unsynced_entities)
            .chain(&report.stale_schema_entities)
            .map(|id| EntityRef::new(id.as_str(), entity_type))
            .collect();
        if !resync.is_empty() {
            let results = self
                .synchronizer
                .sync_entities_batch(&resync, SyncOptions::forced())
                .await;
            repaired += results.iter().filter(|r| r.success).count();
        }

        if !report.orphaned_vectors.is_empty() {
            match self
                .operations
                .delete_vectors_batch(
                    entity_type,
                    report.orphaned_vectors.clone(),
                    Some(schema_version),
                    true,
                )
                .await
            {
                Ok(removed) => repaired += removed,
                Err(e) => warn!(index = %report.index_key, error = %e, "Failed to remove orphaned vectors"),
            }
        }

        repaired
    }

    /// Reconcile every entity type that has an active index
    pub async fn reconcile_all(&self, repair: bool) -> Vec<ReconciliationReport> {
        let mut reports = Vec::new();
        for entity_type in EntityType::ALL {
            match self.reconcile(entity_type, repair).await {
                Ok(report) => reports.push(report),
                Err(VectorError::NotFound(_)) => {
                    info!(entity_type = %entity_type, "No active index, skipping")
                }
                Err(e) => error!(entity_type = %entity_type, error = %e, "Reconciliation failed"),
            }
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index_service::Datapoint;
    use crate::memory::{MemoryDocumentStore, MemoryIndexService, StaticEmbeddingProvider};
    use crate::schema::SchemaRegistry;
    use crate::store::Updates;
    use resilience::CircuitBreakerConfig;
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryDocumentStore>,
        service: Arc<MemoryIndexService>,
        embeddings: Arc<StaticEmbeddingProvider>,
        synchronizer: Arc<EntitySynchronizer>,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryDocumentStore::new());
        let service = Arc::new(MemoryIndexService::new());
        let guard = Arc::new(ServiceGuard::without_retry(
            "vector-index",
            CircuitBreakerConfig::new(),
        ));
        let manager = Arc::new(IndexManager::new(
            store.clone(),
            service.clone(),
            Arc::new(SchemaRegistry::with_defaults(4)),
            guard.clone(),
            "dev",
        ));
        let operations = Arc::new(VectorOperations::new(
            manager.clone(),
            service.clone(),
            guard.clone(),
        ));
        let embeddings = Arc::new(StaticEmbeddingProvider::new(4));
        let synchronizer = Arc::new(EntitySynchronizer::new(
            store.clone(),
            embeddings.clone(),
            operations.clone(),
            Arc::new(ServiceGuard::without_retry(
                "embedding",
                CircuitBreakerConfig::new(),
            )),
            "text-embedding-004",
        ));
        let reconciler = Reconciler::new(
            store.clone(),
            manager,
            service.clone(),
            guard,
            operations,
            synchronizer.clone(),
        );
        Fixture {
            store,
            service,
            embeddings,
            synchronizer,
            reconciler,
        }
    }

    async fn seed(f: &Fixture) -> String {
        for id in ["c1", "c2", "c3"] {
            f.store
                .insert("characters", id, json!({ "name": format!("Hero {}", id) }))
                .await;
            f.synchronizer
                .sync_entity(id, EntityType::Character, SyncOptions::default())
                .await
                .unwrap();
        }
        "indexes/dev-character-v1".to_string()
    }

    #[tokio::test]
    async fn test_consistent_index() {
        let f = fixture();
        seed(&f).await;

        let report = f.reconciler.reconcile(EntityType::Character, false).await.unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.entities_checked, 3);
        assert_eq!(report.vectors_in_index, 3);
    }

    #[tokio::test]
    async fn test_detects_and_repairs_drift() {
        let f = fixture();
        let index = seed(&f).await;

        // c1 lost its vector
        let c1 = f.store.fields("characters", "c1").await.unwrap();
        f.service
            .remove_datapoints(&index, vec![c1["vectorId"].as_str().unwrap().to_string()])
            .await
            .unwrap();
        // c2 never finished
        f.store
            .update("characters", "c2", Updates::new().set("vectorStatus", "FAILED"))
            .await
            .unwrap();
        // a vector nobody references
        f.service
            .upsert_datapoints(
                &index,
                vec![Datapoint {
                    id: "stray".to_string(),
                    values: vec![0.5; 4],
                    restricts: vec![],
                }],
            )
            .await
            .unwrap();

        let report = f.reconciler.reconcile(EntityType::Character, false).await.unwrap();
        assert_eq!(report.missing_vectors, vec!["c1"]);
        assert_eq!(report.unsynced_entities, vec!["c2"]);
        assert_eq!(report.orphaned_vectors, vec!["stray"]);
        assert_eq!(report.repaired, 0);

        let repaired = f.reconciler.reconcile(EntityType::Character, true).await.unwrap();
        assert_eq!(repaired.repaired, 3);
        assert!(f.service.datapoint(&index, "stray").is_none());

        let after = f.reconciler.reconcile(EntityType::Character, false).await.unwrap();
        assert!(after.is_consistent(), "{:?}", after);
    }

    #[tokio::test]
    async fn test_entities_without_text_are_not_drift() {
        let f = fixture();
        seed(&f).await;
        f.store
            .insert("characters", "blank", json!({ "name": "  " }))
            .await;
        let result = f
            .synchronizer
            .sync_entity("blank", EntityType::Character, SyncOptions::default())
            .await
            .unwrap();
        assert!(!result.success);
        let embeds = f.embeddings.call_count();

        let report = f.reconciler.reconcile(EntityType::Character, true).await.unwrap();
        assert_eq!(report.no_content_entities, vec!["blank"]);
        assert!(report.unsynced_entities.is_empty());
        assert!(report.is_consistent(), "{:?}", report);
        assert_eq!(report.repaired, 0);
        assert_eq!(f.embeddings.call_count(), embeds);
    }

    #[tokio::test]
    async fn test_stale_schema_entities() {
        let f = fixture();
        seed(&f).await;
        f.store
            .update("characters", "c3", Updates::new().set("schemaVersion", 0))
            .await
            .unwrap();

        let report = f.reconciler.reconcile(EntityType::Character, false).await.unwrap();
        assert_eq!(report.stale_schema_entities, vec!["c3"]);
    }

    #[tokio::test]
    async fn test_reconcile_all_skips_types_without_index() {
        let f = fixture();
        seed(&f).await;

        let reports = f.reconciler.reconcile_all(false).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].entity_type, EntityType::Character);
    }
}
