//! Qdrant-backed implementation of VectorIndexService
//!
//! Each index is a Qdrant collection named after the index key. The serving
//! "endpoint" is the Qdrant deployment itself, so creating an endpoint is a
//! no-op and deploying verifies the collection exists.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use core_config::{ConfigError, FromEnv, env_or_default, env_parse_or};
use qdrant_client::Qdrant;
use qdrant_client::qdrant::{
    self, Condition, CountPointsBuilder, CreateCollectionBuilder, DeletePointsBuilder, Distance,
    Filter, GetPointsBuilder, HnswConfigDiff, ListValue, PointId, PointStruct, ScrollPointsBuilder,
    SearchPointsBuilder, UpsertPointsBuilder, Value as QdrantValue, VectorParamsBuilder,
    value::Kind,
};
use tracing::{debug, info, instrument};

use super::{Datapoint, IndexSpec, Neighbor, NeighborQuery, VectorIndexService};
use crate::error::{VectorError, VectorResult};
use crate::schema::{DistanceMeasure, NeighborAlgorithm};

const RESTRICTS_KEY: &str = "restricts";
const SCROLL_PAGE_SIZE: u32 = 256;

/// Qdrant connection configuration
#[derive(Debug, Clone)]
pub struct QdrantConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl QdrantConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: None,
            timeout_secs: 30,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self::new("http://localhost:6334")
    }
}

impl FromEnv for QdrantConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            url: env_or_default("QDRANT_URL", "http://localhost:6334"),
            api_key: std::env::var("QDRANT_API_KEY").ok().filter(|k| !k.is_empty()),
            timeout_secs: env_parse_or("QDRANT_TIMEOUT_SECS", 30)?,
        })
    }
}

pub struct QdrantIndexService {
    client: Qdrant,
}

impl QdrantIndexService {
    pub fn new(config: &QdrantConfig) -> VectorResult<Self> {
        let mut builder = Qdrant::from_url(&config.url);

        if let Some(ref api_key) = config.api_key {
            builder = builder.api_key(api_key.clone());
        }

        builder = builder.timeout(Duration::from_secs(config.timeout_secs));

        let client = builder
            .build()
            .map_err(|e| VectorError::Config(format!("Failed to build Qdrant client: {}", e)))?;

        Ok(Self { client })
    }

    pub fn from_client(client: Qdrant) -> Self {
        Self { client }
    }

    fn to_qdrant_distance(measure: DistanceMeasure) -> Distance {
        match measure {
            DistanceMeasure::DotProduct => Distance::Dot,
            DistanceMeasure::Cosine => Distance::Cosine,
            DistanceMeasure::SquaredL2 => Distance::Euclid,
            DistanceMeasure::L1 => Distance::Manhattan,
        }
    }

    /// Tree-AH maps onto the HNSW graph; brute force disables it (`m = 0`)
    fn to_hnsw_config(algorithm: &NeighborAlgorithm) -> HnswConfigDiff {
        match algorithm {
            NeighborAlgorithm::TreeAh {
                leaf_node_embedding_count,
                ..
            } => HnswConfigDiff {
                m: Some(16),
                ef_construct: Some(100),
                full_scan_threshold: Some(u64::from(*leaf_node_embedding_count)),
                ..Default::default()
            },
            NeighborAlgorithm::BruteForce => HnswConfigDiff {
                m: Some(0),
                ..Default::default()
            },
        }
    }

    fn restricts_payload(restricts: Vec<String>) -> HashMap<String, QdrantValue> {
        let values = restricts.into_iter().map(QdrantValue::from).collect();
        let list = QdrantValue {
            kind: Some(Kind::ListValue(ListValue { values })),
        };
        HashMap::from([(RESTRICTS_KEY.to_string(), list)])
    }

    fn restricts_from_payload(payload: &HashMap<String, QdrantValue>) -> Vec<String> {
        match payload.get(RESTRICTS_KEY).and_then(|v| v.kind.as_ref()) {
            Some(Kind::ListValue(list)) => list
                .values
                .iter()
                .filter_map(|v| match &v.kind {
                    Some(Kind::StringValue(s)) => Some(s.clone()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    fn point_id_to_string(point_id: Option<&PointId>) -> VectorResult<String> {
        match point_id.and_then(|p| p.point_id_options.as_ref()) {
            Some(qdrant::point_id::PointIdOptions::Uuid(uuid)) => Ok(uuid.clone()),
            Some(qdrant::point_id::PointIdOptions::Num(num)) => Ok(num.to_string()),
            None => Err(VectorError::Internal("Missing point ID".to_string())),
        }
    }

    /// Extract vector values from VectorsOutput
    #[allow(deprecated)]
    fn extract_vector(vectors: &Option<qdrant::VectorsOutput>) -> Option<Vec<f32>> {
        match vectors {
            Some(qdrant::VectorsOutput {
                vectors_options: Some(opts),
            }) => match opts {
                qdrant::vectors_output::VectorsOptions::Vector(v) => Some(v.data.clone()),
                qdrant::vectors_output::VectorsOptions::Vectors(map) => {
                    map.vectors.values().next().map(|v| v.data.clone())
                }
            },
            _ => None,
        }
    }
}

#[async_trait]
impl VectorIndexService for QdrantIndexService {
    #[instrument(skip(self, spec), fields(index = %spec.name))]
    async fn create_index(&self, spec: IndexSpec) -> VectorResult<String> {
        if self.client.collection_exists(&spec.name).await? {
            info!("Collection already exists, reusing it");
            return Ok(spec.name);
        }

        let structure = &spec.structure;
        let builder = CreateCollectionBuilder::new(&spec.name)
            .vectors_config(VectorParamsBuilder::new(
                u64::from(structure.dimensions),
                Self::to_qdrant_distance(structure.distance_measure),
            ))
            .hnsw_config(Self::to_hnsw_config(&structure.algorithm))
            .shard_number(structure.shard_count);

        self.client.create_collection(builder).await?;
        info!(dimensions = structure.dimensions, "Collection created");
        Ok(spec.name)
    }

    #[instrument(skip(self))]
    async fn delete_index(&self, index: &str) -> VectorResult<()> {
        if !self.client.collection_exists(index).await? {
            debug!("Collection already absent");
            return Ok(());
        }
        self.client.delete_collection(index).await?;
        Ok(())
    }

    async fn get_or_create_endpoint(&self, name: &str) -> VectorResult<String> {
        Ok(name.to_string())
    }

    #[instrument(skip(self))]
    async fn deploy_index(
        &self,
        endpoint: &str,
        index: &str,
        deployed_index_id: &str,
    ) -> VectorResult<()> {
        if !self.client.collection_exists(index).await? {
            return Err(VectorError::NotFound(format!(
                "Cannot deploy missing collection {}",
                index
            )));
        }
        info!(endpoint, deployed_index_id, "Index is served directly by Qdrant");
        Ok(())
    }

    #[instrument(skip(self, datapoints), fields(count = datapoints.len()))]
    async fn upsert_datapoints(&self, index: &str, datapoints: Vec<Datapoint>) -> VectorResult<()> {
        if datapoints.is_empty() {
            return Ok(());
        }

        let points: Vec<PointStruct> = datapoints
            .into_iter()
            .map(|dp| {
                PointStruct::new(
                    PointId::from(dp.id),
                    dp.values,
                    Self::restricts_payload(dp.restricts),
                )
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(index, points).wait(true))
            .await?;
        Ok(())
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn remove_datapoints(&self, index: &str, ids: Vec<String>) -> VectorResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let point_ids: Vec<PointId> = ids.into_iter().map(PointId::from).collect();
        let existing = self
            .client
            .get_points(
                GetPointsBuilder::new(index, point_ids.clone())
                    .with_payload(false)
                    .with_vectors(false),
            )
            .await?
            .result
            .len();
        if existing == 0 {
            return Ok(0);
        }

        self.client
            .delete_points(DeletePointsBuilder::new(index).points(point_ids).wait(true))
            .await?;
        Ok(existing)
    }

    #[instrument(skip(self, query), fields(index = %query.index, k = query.neighbor_count))]
    async fn find_neighbors(&self, query: NeighborQuery) -> VectorResult<Vec<Neighbor>> {
        let mut builder =
            SearchPointsBuilder::new(&query.index, query.vector, query.neighbor_count as u64)
                .with_payload(true)
                .with_vectors(query.return_vectors);

        if !query.restricts.is_empty() {
            let conditions: Vec<Condition> = query
                .restricts
                .into_iter()
                .map(|r| Condition::matches(RESTRICTS_KEY, r))
                .collect();
            builder = builder.filter(Filter::must(conditions));
        }

        let response = self.client.search_points(builder).await?;

        response
            .result
            .into_iter()
            .map(|point| {
                Ok(Neighbor {
                    id: Self::point_id_to_string(point.id.as_ref())?,
                    distance: point.score,
                    values: Self::extract_vector(&point.vectors),
                    restricts: Self::restricts_from_payload(&point.payload),
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn list_datapoint_ids(&self, index: &str) -> VectorResult<Vec<String>> {
        let mut ids = Vec::new();
        let mut offset: Option<PointId> = None;

        loop {
            let mut builder = ScrollPointsBuilder::new(index)
                .limit(SCROLL_PAGE_SIZE)
                .with_payload(false)
                .with_vectors(false);
            if let Some(next) = offset.take() {
                builder = builder.offset(next);
            }

            let page = self.client.scroll(builder).await?;
            for point in &page.result {
                ids.push(Self::point_id_to_string(point.id.as_ref())?);
            }

            match page.next_page_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        debug!(count = ids.len(), "Listed datapoints");
        Ok(ids)
    }

    async fn count_datapoints(&self, index: &str) -> VectorResult<u64> {
        let response = self
            .client
            .count(CountPointsBuilder::new(index).exact(true))
            .await?;
        Ok(response.result.map(|r| r.count).unwrap_or(0))
    }
}
