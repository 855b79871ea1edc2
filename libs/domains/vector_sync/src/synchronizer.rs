//! Keeps each entity's vector consistent with its text content.
//!
//! Per-entity failures are recorded on the entity (`vectorStatus=FAILED`)
//! and returned as unsuccessful [`SyncResult`]s so batches keep going.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, instrument, warn};

use crate::embedding::EmbeddingProvider;
use crate::error::{VectorError, VectorResult};
use crate::guard::ServiceGuard;
use crate::models::{
    BulkSyncOptions, Entity, EntityRef, EntityType, SyncOptions, SyncResult, SyncSummary,
    VectorMetadata, VectorStatus, fields,
};
use crate::operations::{StoreOptions, StoredVector, VectorOperations};
use crate::store::{DocumentStore, Fields, Filter, Updates};
use crate::text::{extract_text, text_changed};

/// Error recorded on entities whose text fields are all empty
pub const EMPTY_TEXT_ERROR: &str = "Entity has no text content";

/// Mutation of an entity document
#[derive(Debug, Clone, PartialEq)]
pub enum EntityEvent {
    Created {
        entity_type: EntityType,
        entity_id: String,
    },
    Updated {
        entity_type: EntityType,
        entity_id: String,
        before: Fields,
        after: Fields,
    },
    /// `before` is the document as it was prior to deletion
    Deleted {
        entity_type: EntityType,
        entity_id: String,
        before: Fields,
    },
}

/// What handling an event did
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Synced(SyncResult),
    /// No text field changed
    Unchanged,
    VectorRemoved(bool),
}

pub struct EntitySynchronizer {
    store: Arc<dyn DocumentStore>,
    embeddings: Arc<dyn EmbeddingProvider>,
    operations: Arc<VectorOperations>,
    guard: Arc<ServiceGuard>,
    model: String,
    concurrency: usize,
}

impl EntitySynchronizer {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        embeddings: Arc<dyn EmbeddingProvider>,
        operations: Arc<VectorOperations>,
        guard: Arc<ServiceGuard>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            store,
            embeddings,
            operations,
            guard,
            model: model.into(),
            concurrency: 1,
        }
    }

    /// Entities synced at once by [`Self::sync_entities_batch`]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    async fn load(&self, entity_id: &str, entity_type: EntityType) -> VectorResult<Option<Entity>> {
        Ok(self
            .store
            .get(entity_type.collection(), entity_id)
            .await?
            .map(|document| Entity::new(document.id, entity_type, document.fields)))
    }

    /// Embed and store the vector for one entity.
    ///
    /// Fails only when the entity is missing or its state cannot be read or
    /// marked pending; everything after that is recorded on the entity.
    #[instrument(skip(self, options), fields(force = options.force))]
    pub async fn sync_entity(
        &self,
        entity_id: &str,
        entity_type: EntityType,
        options: SyncOptions,
    ) -> VectorResult<SyncResult> {
        let entity = self.load(entity_id, entity_type).await?.ok_or_else(|| {
            VectorError::NotFound(format!("{} {}", entity_type.display_name(), entity_id))
        })?;

        if !options.force && entity.sync.is_synced() {
            debug!("Entity already synced");
            return Ok(SyncResult::already_synced(
                entity_id,
                entity_type,
                entity.sync.vector_id.clone(),
            ));
        }

        self.store
            .update(
                entity_type.collection(),
                entity_id,
                Updates::new()
                    .set(fields::VECTOR_STATUS, VectorStatus::Pending.to_string())
                    .server_timestamp(fields::VECTOR_TIMESTAMP),
            )
            .await?;

        let stored = match self.embed_and_store(&entity, options).await {
            Ok(stored) => stored,
            Err(message) => return Ok(self.mark_failed(&entity, message).await),
        };

        let completed = self
            .store
            .update(
                entity_type.collection(),
                entity_id,
                Updates::new()
                    .set(fields::VECTOR_ID, stored.vector_id.as_str())
                    .set(fields::VECTOR_STATUS, VectorStatus::Completed.to_string())
                    .server_timestamp(fields::VECTOR_TIMESTAMP)
                    .set(fields::SCHEMA_VERSION, stored.schema_version)
                    .delete(fields::VECTOR_ERROR),
            )
            .await;
        if let Err(e) = completed {
            error!(vector_id = %stored.vector_id, error = %e, "Vector stored but entity not updated");
            return Ok(self.mark_failed(&entity, e.to_string()).await);
        }

        self.remove_previous_vector(&entity, &stored, options).await;

        info!(vector_id = %stored.vector_id, index = %stored.index_id, "Entity synced");
        Ok(SyncResult::synced(entity_id, entity_type, stored.vector_id))
    }

    async fn embed_and_store(&self, entity: &Entity, options: SyncOptions) -> Result<StoredVector, String> {
        let text = extract_text(entity.entity_type, &entity.fields);
        if text.trim().is_empty() {
            return Err(EMPTY_TEXT_ERROR.to_string());
        }

        let embeddings = &self.embeddings;
        let model = self.model.as_str();
        let embedding = self
            .guard
            .call("embed", || embeddings.embed(model, &text))
            .await
            .map_err(|e| e.to_string())?;

        let schema_version = entity.sync.schema_version.unwrap_or(1);
        let metadata = VectorMetadata::for_entity(entity, schema_version);

        self.operations
            .store_vector(
                &entity.id,
                entity.entity_type,
                embedding.values,
                metadata,
                StoreOptions {
                    create_index_if_not_exists: options.create_index_if_not_exists,
                    update_vector_count: options.update_vector_counts,
                },
            )
            .await
            .map_err(|e| e.to_string())
    }

    async fn mark_failed(&self, entity: &Entity, message: String) -> SyncResult {
        warn!(
            entity_id = %entity.id,
            entity_type = %entity.entity_type,
            error = %message,
            "Entity sync failed"
        );
        let recorded = self
            .store
            .update(
                entity.entity_type.collection(),
                &entity.id,
                Updates::new()
                    .set(fields::VECTOR_STATUS, VectorStatus::Failed.to_string())
                    .set(fields::VECTOR_ERROR, message.as_str())
                    .server_timestamp(fields::VECTOR_TIMESTAMP),
            )
            .await;
        if let Err(e) = recorded {
            error!(entity_id = %entity.id, error = %e, "Failed to record sync failure");
        }
        SyncResult::failed(&entity.id, entity.entity_type, message)
    }

    async fn remove_previous_vector(&self, entity: &Entity, stored: &StoredVector, options: SyncOptions) {
        let Some(previous) = entity.sync.vector_id.as_deref() else {
            return;
        };
        if previous == stored.vector_id {
            return;
        }
        if let Err(e) = self
            .operations
            .delete_vector(
                entity.entity_type,
                previous,
                entity.sync.schema_version,
                options.update_vector_counts,
            )
            .await
        {
            warn!(entity_id = %entity.id, vector_id = %previous, error = %e, "Failed to remove previous vector");
        }
    }

    async fn sync_isolated(&self, entity: &EntityRef, options: SyncOptions) -> SyncResult {
        match self
            .sync_entity(&entity.entity_id, entity.entity_type, options)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!(entity_id = %entity.entity_id, error = %e, "Entity sync failed");
                SyncResult::failed(&entity.entity_id, entity.entity_type, e.to_string())
            }
        }
    }

    async fn sync_with_concurrency(
        &self,
        entities: &[EntityRef],
        options: SyncOptions,
        concurrency: usize,
    ) -> Vec<SyncResult> {
        stream::iter(entities)
            .map(|entity| self.sync_isolated(entity, options))
            .buffered(concurrency.max(1))
            .collect()
            .await
    }

    /// Sync every entity, one result per input in input order
    pub async fn sync_entities_batch(&self, entities: &[EntityRef], options: SyncOptions) -> Vec<SyncResult> {
        self.sync_with_concurrency(entities, options, self.concurrency)
            .await
    }

    /// Sync every entity of a type that is not COMPLETED, or all when forced
    #[instrument(skip(self, options), fields(force = options.force, batch_size = options.batch_size))]
    pub async fn sync_all_entities(
        &self,
        entity_type: EntityType,
        options: BulkSyncOptions,
    ) -> VectorResult<SyncSummary> {
        let filter = if options.force {
            Filter::all()
        } else {
            Filter::all().not_equals(fields::VECTOR_STATUS, VectorStatus::Completed.to_string())
        };
        let ids = self.store.query_ids(entity_type.collection(), filter).await?;
        info!(candidates = ids.len(), "Starting bulk sync");

        let refs: Vec<EntityRef> = ids
            .into_iter()
            .map(|id| EntityRef::new(id, entity_type))
            .collect();

        let mut summary = SyncSummary::start(Some(entity_type));
        for (chunk_number, chunk) in refs.chunks(options.batch_size.max(1)).enumerate() {
            let results = self
                .sync_with_concurrency(chunk, options.sync_options(), options.concurrency)
                .await;
            results.iter().for_each(|r| summary.record(r));
            debug!(
                chunk = chunk_number + 1,
                processed = summary.total,
                failed = summary.failed,
                "Chunk finished"
            );
        }

        let summary = summary.finish();
        info!(
            total = summary.total,
            success = summary.success,
            failed = summary.failed,
            skipped = summary.skipped,
            duration_ms = summary.duration_ms,
            "Bulk sync finished"
        );
        Ok(summary)
    }

    /// Remove an entity's vector and clear its sync fields.
    ///
    /// Returns false when the entity is absent or has no vector.
    #[instrument(skip(self))]
    pub async fn delete_entity_vectors(&self, entity_id: &str, entity_type: EntityType) -> VectorResult<bool> {
        let Some(entity) = self.load(entity_id, entity_type).await? else {
            return Ok(false);
        };
        let Some(vector_id) = entity.sync.vector_id.as_deref() else {
            return Ok(false);
        };

        self.operations
            .delete_vector(entity_type, vector_id, entity.sync.schema_version, true)
            .await?;

        let cleared = fields::SYNC_FIELDS
            .iter()
            .fold(Updates::new(), |updates, field| updates.delete(*field));
        self.store
            .update(entity_type.collection(), entity_id, cleared)
            .await?;

        info!(vector_id = %vector_id, "Entity vector deleted");
        Ok(true)
    }

    /// React to a document mutation
    pub async fn handle_event(&self, event: EntityEvent) -> VectorResult<EventOutcome> {
        match event {
            EntityEvent::Created {
                entity_type,
                entity_id,
            } => {
                let result = self
                    .sync_entity(&entity_id, entity_type, SyncOptions::default())
                    .await?;
                Ok(EventOutcome::Synced(result))
            }
            EntityEvent::Updated {
                entity_type,
                entity_id,
                before,
                after,
            } => {
                if !text_changed(entity_type, &before, &after) {
                    debug!(entity_id = %entity_id, "Text unchanged, skipping resync");
                    return Ok(EventOutcome::Unchanged);
                }
                let result = self
                    .sync_entity(&entity_id, entity_type, SyncOptions::forced())
                    .await?;
                Ok(EventOutcome::Synced(result))
            }
            EntityEvent::Deleted {
                entity_type,
                entity_id,
                before,
            } => {
                let snapshot = Entity::new(entity_id, entity_type, before);
                let Some(vector_id) = snapshot.sync.vector_id.as_deref() else {
                    return Ok(EventOutcome::VectorRemoved(false));
                };
                self.operations
                    .delete_vector(entity_type, vector_id, snapshot.sync.schema_version, true)
                    .await?;
                info!(entity_id = %snapshot.id, vector_id = %vector_id, "Vector of deleted entity removed");
                Ok(EventOutcome::VectorRemoved(true))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingResult, MockEmbeddingProvider};
    use crate::index_manager::IndexManager;
    use crate::memory::{MemoryDocumentStore, MemoryIndexService, StaticEmbeddingProvider};
    use crate::schema::SchemaRegistry;
    use resilience::CircuitBreakerConfig;
    use serde_json::{Value, json};
    use std::sync::atomic::Ordering;

    struct Fixture {
        store: Arc<MemoryDocumentStore>,
        service: Arc<MemoryIndexService>,
        synchronizer: EntitySynchronizer,
    }

    fn fixture_with(embeddings: Arc<dyn EmbeddingProvider>) -> Fixture {
        let store = Arc::new(MemoryDocumentStore::new());
        let service = Arc::new(MemoryIndexService::new());
        let index_guard = Arc::new(ServiceGuard::without_retry(
            "vector-index",
            CircuitBreakerConfig::new(),
        ));
        let manager = Arc::new(IndexManager::new(
            store.clone(),
            service.clone(),
            Arc::new(SchemaRegistry::with_defaults(4)),
            index_guard.clone(),
            "dev",
        ));
        let operations = Arc::new(VectorOperations::new(manager, service.clone(), index_guard));
        let synchronizer = EntitySynchronizer::new(
            store.clone(),
            embeddings,
            operations,
            Arc::new(ServiceGuard::without_retry(
                "embedding",
                CircuitBreakerConfig::new(),
            )),
            "text-embedding-004",
        );
        Fixture {
            store,
            service,
            synchronizer,
        }
    }

    fn fixture() -> (Fixture, Arc<StaticEmbeddingProvider>) {
        let embeddings = Arc::new(StaticEmbeddingProvider::new(4));
        (fixture_with(embeddings.clone()), embeddings)
    }

    fn object(value: Value) -> Fields {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_sync_entity_marks_completed() {
        let (f, _) = fixture();
        f.store
            .insert("characters", "c1", json!({ "name": "Aria", "worldId": "w1" }))
            .await;

        let result = f
            .synchronizer
            .sync_entity("c1", EntityType::Character, SyncOptions::default())
            .await
            .unwrap();
        assert!(result.success);

        let doc = f.store.fields("characters", "c1").await.unwrap();
        assert_eq!(doc["vectorStatus"], "COMPLETED");
        assert_eq!(doc["vectorId"].as_str(), result.vector_id.as_deref());
        assert_eq!(doc["schemaVersion"], 1);
        assert!(doc.contains_key("vectorTimestamp"));
        assert!(!doc.contains_key("vectorError"));
    }

    #[tokio::test]
    async fn test_missing_entity_is_not_found() {
        let (f, _) = fixture();
        let err = f
            .synchronizer
            .sync_entity("ghost", EntityType::Item, SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VectorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_second_sync_is_a_no_op() {
        let (f, embeddings) = fixture();
        f.store.insert("items", "i1", json!({ "name": "Lantern" })).await;

        let first = f
            .synchronizer
            .sync_entity("i1", EntityType::Item, SyncOptions::default())
            .await
            .unwrap();
        let upserts = f.service.calls.upsert.load(Ordering::SeqCst);

        let second = f
            .synchronizer
            .sync_entity("i1", EntityType::Item, SyncOptions::default())
            .await
            .unwrap();
        assert!(second.skipped);
        assert_eq!(second.vector_id, first.vector_id);
        assert_eq!(embeddings.call_count(), 1);
        assert_eq!(f.service.calls.upsert.load(Ordering::SeqCst), upserts);
    }

    #[tokio::test]
    async fn test_empty_text_fails_without_embedding() {
        let mut mock = MockEmbeddingProvider::new();
        mock.expect_embed().never();
        let f = fixture_with(Arc::new(mock));
        f.store
            .insert("notes", "n1", json!({ "name": "  ", "worldId": "w1" }))
            .await;

        let result = f
            .synchronizer
            .sync_entity("n1", EntityType::Note, SyncOptions::default())
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some(EMPTY_TEXT_ERROR));

        let doc = f.store.fields("notes", "n1").await.unwrap();
        assert_eq!(doc["vectorStatus"], "FAILED");
        assert_eq!(doc["vectorError"], EMPTY_TEXT_ERROR);
    }

    #[tokio::test]
    async fn test_embedding_failure_is_recorded() {
        let mut mock = MockEmbeddingProvider::new();
        mock.expect_embed()
            .returning(|_, _| Err(VectorError::Validation("text too long".to_string())));
        let f = fixture_with(Arc::new(mock));
        f.store.insert("quests", "q1", json!({ "name": "Rescue" })).await;

        let result = f
            .synchronizer
            .sync_entity("q1", EntityType::Quest, SyncOptions::default())
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("text too long"));
        assert_eq!(f.service.calls.upsert.load(Ordering::SeqCst), 0);

        let doc = f.store.fields("quests", "q1").await.unwrap();
        assert_eq!(doc["vectorStatus"], "FAILED");
    }

    #[tokio::test]
    async fn test_wrong_embedding_dimension_is_recorded() {
        let mut mock = MockEmbeddingProvider::new();
        mock.expect_embed()
            .returning(|_, _| Ok(EmbeddingResult::new(vec![0.5; 3])));
        let f = fixture_with(Arc::new(mock));
        f.store.insert("items", "i1", json!({ "name": "Lantern" })).await;

        let result = f
            .synchronizer
            .sync_entity("i1", EntityType::Item, SyncOptions::default())
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("dimensions"));
    }

    #[tokio::test]
    async fn test_forced_resync_replaces_previous_vector() {
        let (f, _) = fixture();
        f.store.insert("factions", "f1", json!({ "name": "Guild" })).await;

        let first = f
            .synchronizer
            .sync_entity("f1", EntityType::Faction, SyncOptions::default())
            .await
            .unwrap();
        let second = f
            .synchronizer
            .sync_entity("f1", EntityType::Faction, SyncOptions::forced())
            .await
            .unwrap();

        assert_ne!(first.vector_id, second.vector_id);
        let index = "indexes/dev-faction-v1";
        assert!(f.service.datapoint(index, first.vector_id.as_deref().unwrap()).is_none());
        assert!(f.service.datapoint(index, second.vector_id.as_deref().unwrap()).is_some());
    }

    #[tokio::test]
    async fn test_batch_isolates_failures_and_keeps_order() {
        let (f, embeddings) = fixture();
        embeddings.fail_when_text_contains("cursed");
        f.store.insert("items", "a", json!({ "name": "Sword" })).await;
        f.store.insert("items", "b", json!({ "name": "cursed ring" })).await;
        f.store.insert("items", "c", json!({ "name": "Shield" })).await;

        let refs: Vec<EntityRef> = ["a", "b", "missing", "c"]
            .iter()
            .map(|id| EntityRef::new(*id, EntityType::Item))
            .collect();
        let results = f
            .synchronizer
            .sync_entities_batch(&refs, SyncOptions::default())
            .await;

        let outcome: Vec<(&str, bool)> = results
            .iter()
            .map(|r| (r.entity_id.as_str(), r.success))
            .collect();
        assert_eq!(
            outcome,
            vec![("a", true), ("b", false), ("missing", false), ("c", true)]
        );
    }

    #[tokio::test]
    async fn test_sync_all_selects_unsynced_only() {
        let (f, embeddings) = fixture();
        for id in ["l1", "l2", "l3"] {
            f.store
                .insert("locations", id, json!({ "name": format!("Place {}", id) }))
                .await;
        }
        f.synchronizer
            .sync_entity("l1", EntityType::Location, SyncOptions::default())
            .await
            .unwrap();

        let summary = f
            .synchronizer
            .sync_all_entities(
                EntityType::Location,
                BulkSyncOptions {
                    batch_size: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.success, 2);
        assert_eq!(embeddings.call_count(), 3);

        let forced = f
            .synchronizer
            .sync_all_entities(
                EntityType::Location,
                BulkSyncOptions {
                    force: true,
                    concurrency: 2,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(forced.total, 3);
        assert_eq!(forced.skipped, 0);
    }

    #[tokio::test]
    async fn test_delete_entity_vectors_clears_fields() {
        let (f, _) = fixture();
        f.store.insert("sessions", "s1", json!({ "name": "Session 1" })).await;
        assert!(
            !f.synchronizer
                .delete_entity_vectors("s1", EntityType::Session)
                .await
                .unwrap()
        );

        let synced = f
            .synchronizer
            .sync_entity("s1", EntityType::Session, SyncOptions::default())
            .await
            .unwrap();
        assert!(
            f.synchronizer
                .delete_entity_vectors("s1", EntityType::Session)
                .await
                .unwrap()
        );

        let doc = f.store.fields("sessions", "s1").await.unwrap();
        for field in fields::SYNC_FIELDS {
            assert!(!doc.contains_key(*field), "{} still present", field);
        }
        assert!(
            f.service
                .datapoint("indexes/dev-session-v1", synced.vector_id.as_deref().unwrap())
                .is_none()
        );
        assert!(
            !f.synchronizer
                .delete_entity_vectors("gone", EntityType::Session)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_update_event_ignores_sync_field_writes() {
        let (f, embeddings) = fixture();
        let before = object(json!({ "name": "Aria" }));
        let after = object(json!({ "name": "Aria", "vectorStatus": "COMPLETED", "vectorId": "v1" }));

        let outcome = f
            .synchronizer
            .handle_event(EntityEvent::Updated {
                entity_type: EntityType::Character,
                entity_id: "c1".to_string(),
                before,
                after,
            })
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::Unchanged);
        assert_eq!(embeddings.call_count(), 0);
    }

    #[tokio::test]
    async fn test_update_and_delete_events() {
        let (f, embeddings) = fixture();
        f.store.insert("characters", "c1", json!({ "name": "Aria" })).await;
        f.synchronizer
            .handle_event(EntityEvent::Created {
                entity_type: EntityType::Character,
                entity_id: "c1".to_string(),
            })
            .await
            .unwrap();

        let before = f.store.fields("characters", "c1").await.unwrap();
        let mut after = before.clone();
        after.insert("description".to_string(), json!("A wandering bard"));
        f.store
            .insert("characters", "c1", Value::Object(after.clone()))
            .await;

        let outcome = f
            .synchronizer
            .handle_event(EntityEvent::Updated {
                entity_type: EntityType::Character,
                entity_id: "c1".to_string(),
                before,
                after,
            })
            .await
            .unwrap();
        let EventOutcome::Synced(result) = outcome else {
            panic!("expected a resync");
        };
        assert!(result.success && !result.skipped);
        assert_eq!(embeddings.call_count(), 2);

        let snapshot = f.store.fields("characters", "c1").await.unwrap();
        let outcome = f
            .synchronizer
            .handle_event(EntityEvent::Deleted {
                entity_type: EntityType::Character,
                entity_id: "c1".to_string(),
                before: snapshot,
            })
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::VectorRemoved(true));
        assert!(
            f.service
                .datapoint("indexes/dev-character-v1", result.vector_id.as_deref().unwrap())
                .is_none()
        );
    }
}
