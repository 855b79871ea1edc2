use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::error::{VectorError, VectorResult};
use crate::index_service::{Datapoint, IndexSpec, Neighbor, NeighborQuery, VectorIndexService};
use crate::schema::{DistanceMeasure, IndexStructure};

#[derive(Debug)]
struct MemoryIndex {
    structure: IndexStructure,
    points: BTreeMap<String, Datapoint>,
}

#[derive(Debug, Default)]
struct State {
    indexes: HashMap<String, MemoryIndex>,
    endpoints: HashSet<String>,
    /// index resource -> (endpoint, deployed index id)
    deployments: HashMap<String, (String, String)>,
    failing_indexes: HashSet<String>,
}

/// Call counters, one per service operation
#[derive(Debug, Default)]
pub struct IndexServiceCalls {
    pub create_index: AtomicUsize,
    pub delete_index: AtomicUsize,
    pub endpoint: AtomicUsize,
    pub deploy: AtomicUsize,
    pub upsert: AtomicUsize,
    pub remove: AtomicUsize,
    pub query: AtomicUsize,
    pub list: AtomicUsize,
}

impl IndexServiceCalls {
    pub fn total(&self) -> usize {
        [
            &self.create_index,
            &self.delete_index,
            &self.endpoint,
            &self.deploy,
            &self.upsert,
            &self.remove,
            &self.query,
            &self.list,
        ]
        .iter()
        .map(|c| c.load(Ordering::SeqCst))
        .sum()
    }
}

/// In-memory vector index service with exact brute-force search.
///
/// Resource names are `indexes/<name>`. Failure injection can make the
/// whole service unavailable or make writes to one index fail.
#[derive(Debug, Default)]
pub struct MemoryIndexService {
    state: Mutex<State>,
    unavailable: AtomicBool,
    deploy_failures: AtomicUsize,
    pub calls: IndexServiceCalls,
}

impl MemoryIndexService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails with a retryable external service error while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The next `count` deployments fail with a retryable error
    pub fn fail_next_deploys(&self, count: usize) {
        self.deploy_failures.store(count, Ordering::SeqCst);
    }

    /// Upserts and removals against `index` fail
    pub fn fail_writes_to(&self, index: &str) {
        self.lock().failing_indexes.insert(index.to_string());
    }

    pub fn index_exists(&self, index: &str) -> bool {
        self.lock().indexes.contains_key(index)
    }

    pub fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().indexes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn datapoint(&self, index: &str, id: &str) -> Option<Datapoint> {
        self.lock()
            .indexes
            .get(index)
            .and_then(|i| i.points.get(id))
            .cloned()
    }

    pub fn deployment(&self, index: &str) -> Option<(String, String)> {
        self.lock().deployments.get(index).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self, counter: &AtomicUsize) -> VectorResult<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(VectorError::external("vector-index", "service unavailable"));
        }
        Ok(())
    }

    fn missing(index: &str) -> VectorError {
        VectorError::NotFound(format!("index {}", index))
    }

    fn writable<'a>(state: &'a mut State, index: &str) -> VectorResult<&'a mut MemoryIndex> {
        if state.failing_indexes.contains(index) {
            return Err(VectorError::external("vector-index", format!("write to {} failed", index)));
        }
        state.indexes.get_mut(index).ok_or_else(|| Self::missing(index))
    }
}

fn distance(measure: DistanceMeasure, a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    match measure {
        DistanceMeasure::DotProduct => dot,
        DistanceMeasure::Cosine => {
            let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm_a == 0.0 || norm_b == 0.0 {
                0.0
            } else {
                dot / (norm_a * norm_b)
            }
        }
        DistanceMeasure::SquaredL2 => a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum(),
        DistanceMeasure::L1 => a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum(),
    }
}

#[async_trait]
impl VectorIndexService for MemoryIndexService {
    async fn create_index(&self, spec: IndexSpec) -> VectorResult<String> {
        self.check_available(&self.calls.create_index)?;
        let resource = format!("indexes/{}", spec.name);
        self.lock()
            .indexes
            .entry(resource.clone())
            .or_insert_with(|| MemoryIndex {
                structure: spec.structure,
                points: BTreeMap::new(),
            });
        Ok(resource)
    }

    async fn delete_index(&self, index: &str) -> VectorResult<()> {
        self.check_available(&self.calls.delete_index)?;
        let mut state = self.lock();
        state.indexes.remove(index);
        state.deployments.remove(index);
        Ok(())
    }

    async fn get_or_create_endpoint(&self, name: &str) -> VectorResult<String> {
        self.check_available(&self.calls.endpoint)?;
        let resource = format!("endpoints/{}", name);
        self.lock().endpoints.insert(resource.clone());
        Ok(resource)
    }

    async fn deploy_index(
        &self,
        endpoint: &str,
        index: &str,
        deployed_index_id: &str,
    ) -> VectorResult<()> {
        self.check_available(&self.calls.deploy)?;
        if self
            .deploy_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(VectorError::external("vector-index", "deployment failed"));
        }
        let mut state = self.lock();
        if !state.endpoints.contains(endpoint) {
            return Err(VectorError::NotFound(format!("endpoint {}", endpoint)));
        }
        if !state.indexes.contains_key(index) {
            return Err(Self::missing(index));
        }
        state.deployments.insert(
            index.to_string(),
            (endpoint.to_string(), deployed_index_id.to_string()),
        );
        Ok(())
    }

    async fn upsert_datapoints(&self, index: &str, datapoints: Vec<Datapoint>) -> VectorResult<()> {
        self.check_available(&self.calls.upsert)?;
        let mut state = self.lock();
        let target = Self::writable(&mut state, index)?;

        let dimensions = target.structure.dimensions as usize;
        if let Some(bad) = datapoints.iter().find(|dp| dp.values.len() != dimensions) {
            return Err(VectorError::Validation(format!(
                "datapoint {} has {} dimensions, index expects {}",
                bad.id,
                bad.values.len(),
                dimensions
            )));
        }

        for datapoint in datapoints {
            target.points.insert(datapoint.id.clone(), datapoint);
        }
        Ok(())
    }

    async fn remove_datapoints(&self, index: &str, ids: Vec<String>) -> VectorResult<usize> {
        self.check_available(&self.calls.remove)?;
        let mut state = self.lock();
        let target = Self::writable(&mut state, index)?;
        Ok(ids
            .iter()
            .filter(|id| target.points.remove(id.as_str()).is_some())
            .count())
    }

    async fn find_neighbors(&self, query: NeighborQuery) -> VectorResult<Vec<Neighbor>> {
        self.check_available(&self.calls.query)?;
        let state = self.lock();
        let target = state
            .indexes
            .get(&query.index)
            .ok_or_else(|| Self::missing(&query.index))?;
        let measure = target.structure.distance_measure;

        let mut neighbors: Vec<Neighbor> = target
            .points
            .values()
            .filter(|dp| query.restricts.iter().all(|r| dp.restricts.contains(r)))
            .map(|dp| Neighbor {
                id: dp.id.clone(),
                distance: distance(measure, &query.vector, &dp.values),
                values: query.return_vectors.then(|| dp.values.clone()),
                restricts: dp.restricts.clone(),
            })
            .collect();

        neighbors.sort_by(|a, b| {
            let ordering = a.distance.total_cmp(&b.distance);
            if measure.higher_is_closer() {
                ordering.reverse()
            } else {
                ordering
            }
        });
        neighbors.truncate(query.neighbor_count);
        Ok(neighbors)
    }

    async fn list_datapoint_ids(&self, index: &str) -> VectorResult<Vec<String>> {
        self.check_available(&self.calls.list)?;
        let state = self.lock();
        let target = state.indexes.get(index).ok_or_else(|| Self::missing(index))?;
        Ok(target.points.keys().cloned().collect())
    }

    async fn count_datapoints(&self, index: &str) -> VectorResult<u64> {
        self.check_available(&self.calls.list)?;
        let state = self.lock();
        let target = state.indexes.get(index).ok_or_else(|| Self::missing(index))?;
        Ok(target.points.len() as u64)
    }
}
