//! Vector index service seam.
//!
//! Covers index create/delete, endpoint create/deploy, datapoint
//! upsert/remove, nearest neighbour queries and datapoint listing.
//! Metadata travels as `key=value` restrict strings.

mod qdrant;

pub use qdrant::{QdrantConfig, QdrantIndexService};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::VectorResult;
use crate::schema::IndexStructure;

/// Request to create an index
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    /// Stable name of the index, usually the metadata record key
    pub name: String,
    pub structure: IndexStructure,
}

/// A vector with its restricts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    pub id: String,
    pub values: Vec<f32>,
    pub restricts: Vec<String>,
}

/// Nearest neighbour query against a deployed index
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborQuery {
    pub endpoint: String,
    pub deployed_index_id: String,
    /// Resource name of the queried index
    pub index: String,
    pub vector: Vec<f32>,
    pub neighbor_count: usize,
    pub return_vectors: bool,
    /// `key=value` restricts a neighbour must carry
    pub restricts: Vec<String>,
}

/// A neighbour returned by the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub id: String,
    pub distance: f32,
    pub values: Option<Vec<f32>>,
    pub restricts: Vec<String>,
}

/// Managed vector index service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VectorIndexService: Send + Sync {
    /// Create an index and return its resource name
    async fn create_index(&self, spec: IndexSpec) -> VectorResult<String>;

    async fn delete_index(&self, index: &str) -> VectorResult<()>;

    /// Return the named endpoint, creating it when missing
    async fn get_or_create_endpoint(&self, name: &str) -> VectorResult<String>;

    async fn deploy_index(
        &self,
        endpoint: &str,
        index: &str,
        deployed_index_id: &str,
    ) -> VectorResult<()>;

    async fn upsert_datapoints(&self, index: &str, datapoints: Vec<Datapoint>) -> VectorResult<()>;

    /// Remove datapoints by id and return how many existed
    async fn remove_datapoints(&self, index: &str, ids: Vec<String>) -> VectorResult<usize>;

    async fn find_neighbors(&self, query: NeighborQuery) -> VectorResult<Vec<Neighbor>>;

    /// Every datapoint id held by an index
    async fn list_datapoint_ids(&self, index: &str) -> VectorResult<Vec<String>>;

    async fn count_datapoints(&self, index: &str) -> VectorResult<u64>;
}
