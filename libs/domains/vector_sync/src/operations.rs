//! Vector operations against the active index of each entity type.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{VectorError, VectorResult};
use crate::guard::ServiceGuard;
use crate::index_manager::IndexManager;
use crate::index_service::{Datapoint, NeighborQuery, VectorIndexService};
use crate::models::{BatchItemResult, BatchOperationResult, EntityType, IndexMetadata, VectorMetadata};

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Create, activate and deploy an index when the type has none
    pub create_index_if_not_exists: bool,
    pub update_vector_count: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            create_index_if_not_exists: true,
            update_vector_count: true,
        }
    }
}

/// Where a vector ended up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredVector {
    pub vector_id: String,
    pub index_id: String,
    pub schema_version: u32,
}

/// One vector of a batch store
#[derive(Debug, Clone, PartialEq)]
pub struct VectorInput {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub embedding: Vec<f32>,
    pub metadata: VectorMetadata,
}

#[derive(Debug, Clone)]
pub struct FindOptions {
    pub neighbor_count: usize,
    pub include_vectors: bool,
    pub include_metadata: bool,
    /// Neighbours must carry every one of these metadata values
    pub filter: VectorMetadata,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            neighbor_count: 10,
            include_vectors: false,
            include_metadata: true,
            filter: VectorMetadata::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarVector {
    pub id: String,
    pub distance: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<VectorMetadata>,
}

pub struct VectorOperations {
    manager: Arc<IndexManager>,
    service: Arc<dyn VectorIndexService>,
    guard: Arc<ServiceGuard>,
}

fn resource_of(index: &IndexMetadata) -> VectorResult<&str> {
    index.resource_name.as_deref().ok_or_else(|| {
        VectorError::InvalidOperation(format!("Index {} has no resource yet", index.index_id))
    })
}

fn check_dimension(index: &IndexMetadata, values: &[f32]) -> VectorResult<()> {
    let expected = index.structure.dimensions as usize;
    if values.len() != expected {
        return Err(VectorError::Validation(format!(
            "Vector has {} dimensions, index {} expects {}",
            values.len(),
            index.index_id,
            expected
        )));
    }
    Ok(())
}

/// Filter keys must be restrictable on the index
fn check_filter(index: &IndexMetadata, filter: &VectorMetadata) -> VectorResult<()> {
    let fields = &index.structure.metadata_fields;
    match filter.keys().find(|key| !fields.iter().any(|f| f == key)) {
        Some(key) => Err(VectorError::Validation(format!(
            "Filter key '{}' is not a metadata field of index {}",
            key, index.index_id
        ))),
        None => Ok(()),
    }
}

impl VectorOperations {
    pub fn new(
        manager: Arc<IndexManager>,
        service: Arc<dyn VectorIndexService>,
        guard: Arc<ServiceGuard>,
    ) -> Self {
        Self {
            manager,
            service,
            guard,
        }
    }

    async fn target_index(&self, entity_type: EntityType, create: bool) -> VectorResult<IndexMetadata> {
        if create {
            return self.manager.ensure_active_index(entity_type).await;
        }
        self.manager
            .get_active_index(entity_type)
            .await?
            .ok_or_else(|| VectorError::NotFound(format!("No active index for {}", entity_type.as_key())))
    }

    /// Index holding vectors written at `schema_version`, or the active one
    async fn holding_index(
        &self,
        entity_type: EntityType,
        schema_version: Option<u32>,
    ) -> VectorResult<IndexMetadata> {
        match schema_version {
            Some(version) => self
                .manager
                .get_index_metadata(entity_type, version)
                .await?
                .ok_or_else(|| {
                    VectorError::NotFound(format!(
                        "Index {}",
                        self.manager.index_key(entity_type, version)
                    ))
                }),
            None => self.target_index(entity_type, false).await,
        }
    }

    async fn adjust_count(&self, index: &IndexMetadata, delta: i64) {
        if let Err(e) = self
            .manager
            .adjust_vector_count(index.entity_type, index.schema_version, delta)
            .await
        {
            warn!(index = %index.index_id, delta, error = %e, "Failed to update vector count");
        }
    }

    /// Store one vector in the active index of `entity_type`.
    ///
    /// The metadata's `schemaVersion` is set to the version of the index
    /// that receives the vector.
    #[instrument(skip(self, embedding, metadata), fields(dimensions = embedding.len()))]
    pub async fn store_vector(
        &self,
        entity_id: &str,
        entity_type: EntityType,
        embedding: Vec<f32>,
        metadata: VectorMetadata,
        options: StoreOptions,
    ) -> VectorResult<StoredVector> {
        let index = self
            .target_index(entity_type, options.create_index_if_not_exists)
            .await?;
        let resource = resource_of(&index)?;
        check_dimension(&index, &embedding)?;

        let vector_id = Uuid::new_v4().to_string();
        let metadata = metadata
            .with("entityId", entity_id)
            .with("schemaVersion", index.schema_version.to_string());
        let datapoint = Datapoint {
            id: vector_id.clone(),
            values: embedding,
            restricts: metadata.to_restricts(&index.structure.metadata_fields),
        };

        let service = &self.service;
        self.guard
            .call("upsert_datapoints", || {
                service.upsert_datapoints(resource, vec![datapoint.clone()])
            })
            .await?;

        if options.update_vector_count {
            self.adjust_count(&index, 1).await;
        }

        debug!(vector_id = %vector_id, index = %index.index_id, "Vector stored");
        Ok(StoredVector {
            vector_id,
            index_id: index.index_id,
            schema_version: index.schema_version,
        })
    }

    /// Store many vectors with one upsert per entity type.
    ///
    /// Items fail individually on bad dimensions; an index or upsert failure
    /// fails every item of that entity type. Item order follows the input.
    pub async fn store_vectors_batch(
        &self,
        inputs: Vec<VectorInput>,
        options: StoreOptions,
    ) -> BatchOperationResult {
        let start = Utc::now();
        let mut slots: Vec<Option<BatchItemResult>> = vec![None; inputs.len()];

        let mut groups: BTreeMap<EntityType, Vec<(usize, VectorInput)>> = BTreeMap::new();
        for (position, input) in inputs.into_iter().enumerate() {
            groups.entry(input.entity_type).or_default().push((position, input));
        }

        for (entity_type, group) in groups {
            let failure = |input: &VectorInput, message: String| BatchItemResult {
                entity_id: input.entity_id.clone(),
                entity_type,
                success: false,
                vector_id: None,
                error: Some(message),
            };

            let index = match self
                .target_index(entity_type, options.create_index_if_not_exists)
                .await
                .and_then(|index| {
                    resource_of(&index)?;
                    Ok(index)
                })
            {
                Ok(index) => index,
                Err(e) => {
                    warn!(entity_type = %entity_type, error = %e, "No usable index for batch");
                    for (position, input) in &group {
                        slots[*position] = Some(failure(input, e.to_string()));
                    }
                    continue;
                }
            };

            let mut pending: Vec<(usize, VectorInput, String)> = Vec::new();
            let mut datapoints = Vec::new();
            for (position, input) in group {
                if let Err(e) = check_dimension(&index, &input.embedding) {
                    slots[position] = Some(failure(&input, e.to_string()));
                    continue;
                }
                let vector_id = Uuid::new_v4().to_string();
                let metadata = input
                    .metadata
                    .clone()
                    .with("entityId", input.entity_id.as_str())
                    .with("schemaVersion", index.schema_version.to_string());
                datapoints.push(Datapoint {
                    id: vector_id.clone(),
                    values: input.embedding.clone(),
                    restricts: metadata.to_restricts(&index.structure.metadata_fields),
                });
                pending.push((position, input, vector_id));
            }

            if datapoints.is_empty() {
                continue;
            }

            let service = &self.service;
            let resource = index.resource_name.as_deref().unwrap_or_default();
            let upserted = self
                .guard
                .call("upsert_datapoints", || {
                    service.upsert_datapoints(resource, datapoints.clone())
                })
                .await;

            match upserted {
                Ok(()) => {
                    if options.update_vector_count {
                        self.adjust_count(&index, pending.len() as i64).await;
                    }
                    for (position, input, vector_id) in pending {
                        slots[position] = Some(BatchItemResult {
                            entity_id: input.entity_id,
                            entity_type,
                            success: true,
                            vector_id: Some(vector_id),
                            error: None,
                        });
                    }
                }
                Err(e) => {
                    warn!(index = %index.index_id, error = %e, "Batch upsert failed");
                    for (position, input, _) in pending {
                        slots[position] = Some(failure(&input, e.to_string()));
                    }
                }
            }
        }

        let result = BatchOperationResult::from_items(start, slots.into_iter().flatten().collect());
        info!(
            total = result.total,
            success = result.success,
            failed = result.failed,
            "Batch store finished"
        );
        result
    }

    /// Remove one vector from the index it was written to
    #[instrument(skip(self))]
    pub async fn delete_vector(
        &self,
        entity_type: EntityType,
        vector_id: &str,
        schema_version: Option<u32>,
        update_vector_count: bool,
    ) -> VectorResult<()> {
        self.delete_vectors_batch(
            entity_type,
            vec![vector_id.to_string()],
            schema_version,
            update_vector_count,
        )
        .await
        .map(|_| ())
    }

    /// Remove vectors with one service call.
    ///
    /// Returns how many of the ids the index actually held; the stored
    /// vector count moves by that number only.
    pub async fn delete_vectors_batch(
        &self,
        entity_type: EntityType,
        vector_ids: Vec<String>,
        schema_version: Option<u32>,
        update_vector_count: bool,
    ) -> VectorResult<usize> {
        if vector_ids.is_empty() {
            return Ok(0);
        }
        let index = self.holding_index(entity_type, schema_version).await?;
        let resource = resource_of(&index)?;

        let service = &self.service;
        let removed = self
            .guard
            .call("remove_datapoints", || {
                service.remove_datapoints(resource, vector_ids.clone())
            })
            .await?;

        if update_vector_count && removed > 0 {
            self.adjust_count(&index, -(removed as i64)).await;
        }
        debug!(index = %index.index_id, removed, "Vectors removed");
        Ok(removed)
    }

    /// Nearest neighbours of `query` in the deployed active index
    #[instrument(skip(self, query, options), fields(neighbor_count = options.neighbor_count))]
    pub async fn find_similar_vectors(
        &self,
        query: &[f32],
        entity_type: EntityType,
        options: FindOptions,
    ) -> VectorResult<Vec<SimilarVector>> {
        let index = self.target_index(entity_type, false).await?;
        check_dimension(&index, query)?;
        check_filter(&index, &options.filter)?;
        let index = self.manager.ensure_deployed(index).await?;
        let resource = resource_of(&index)?;
        let (Some(endpoint), Some(deployed_index_id)) =
            (index.endpoint_id.clone(), index.deployed_index_id.clone())
        else {
            return Err(VectorError::InvalidOperation(format!(
                "Index {} is not deployed",
                index.index_id
            )));
        };

        let restricts = options.filter.to_restricts(&index.structure.metadata_fields);
        let neighbor_query = NeighborQuery {
            endpoint,
            deployed_index_id,
            index: resource.to_string(),
            vector: query.to_vec(),
            neighbor_count: options.neighbor_count,
            return_vectors: options.include_vectors,
            restricts,
        };

        let service = &self.service;
        let neighbors = self
            .guard
            .call("find_neighbors", || service.find_neighbors(neighbor_query.clone()))
            .await?;

        Ok(neighbors
            .into_iter()
            .map(|n| SimilarVector {
                metadata: options
                    .include_metadata
                    .then(|| VectorMetadata::from_restricts(&n.restricts)),
                vector: if options.include_vectors { n.values } else { None },
                distance: n.distance,
                id: n.id,
            })
            .collect())
    }
}
