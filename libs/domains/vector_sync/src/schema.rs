//! Versioned index structure definitions keyed by (entity type, schema version).
//!
//! A structure is immutable once registered. Changing dimension, metadata
//! fields or algorithm means registering a new version and creating a new
//! index from it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{VectorError, VectorResult};
use crate::models::EntityType;

/// Dimension produced by the reference embedding model.
pub const DEFAULT_DIMENSION: u32 = 768;

/// Metadata fields carried alongside every vector unless a structure says otherwise.
pub const DEFAULT_METADATA_FIELDS: &[&str] = &[
    "entityId",
    "entityType",
    "worldId",
    "campaignId",
    "createdAt",
    "updatedAt",
    "schemaVersion",
];

/// Distance measure used by the index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DistanceMeasure {
    #[default]
    DotProduct,
    Cosine,
    SquaredL2,
    L1,
}

impl DistanceMeasure {
    /// Whether a larger value means a closer neighbour.
    pub fn higher_is_closer(&self) -> bool {
        matches!(self, DistanceMeasure::DotProduct | DistanceMeasure::Cosine)
    }
}

/// Nearest-neighbour algorithm configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NeighborAlgorithm {
    #[serde(rename_all = "camelCase")]
    TreeAh {
        leaf_node_embedding_count: u32,
        leaf_nodes_to_search_percent: u32,
    },
    BruteForce,
}

impl Default for NeighborAlgorithm {
    fn default() -> Self {
        NeighborAlgorithm::TreeAh {
            leaf_node_embedding_count: 1000,
            leaf_nodes_to_search_percent: 10,
        }
    }
}

/// Structure of a vector index for one entity type and schema version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStructure {
    pub display_name: String,
    pub description: String,
    /// Ordered metadata fields encoded as restricts on every datapoint
    pub metadata_fields: Vec<String>,
    pub dimensions: u32,
    pub algorithm: NeighborAlgorithm,
    pub distance_measure: DistanceMeasure,
    pub approximate_neighbors_count: u32,
    pub shard_count: u32,
}

impl IndexStructure {
    /// Default structure for an entity type at a schema version
    pub fn default_for(entity_type: EntityType, schema_version: u32, dimensions: u32) -> Self {
        Self {
            display_name: format!("{} vectors v{}", entity_type.display_name(), schema_version),
            description: format!(
                "Semantic search index for {} entities (schema v{})",
                entity_type.as_key(),
                schema_version
            ),
            metadata_fields: DEFAULT_METADATA_FIELDS
                .iter()
                .map(|f| f.to_string())
                .collect(),
            dimensions,
            algorithm: NeighborAlgorithm::default(),
            distance_measure: DistanceMeasure::default(),
            approximate_neighbors_count: 150,
            shard_count: 1,
        }
    }

    pub fn validate(&self) -> VectorResult<()> {
        if self.dimensions == 0 {
            return Err(VectorError::Validation(
                "Index dimensions must be greater than zero".to_string(),
            ));
        }
        if self.shard_count == 0 {
            return Err(VectorError::Validation(
                "Index shard count must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Partial structure applied on top of a registered one (`customStructure`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructureOverride {
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub metadata_fields: Option<Vec<String>>,
    pub dimensions: Option<u32>,
    pub algorithm: Option<NeighborAlgorithm>,
    pub distance_measure: Option<DistanceMeasure>,
    pub approximate_neighbors_count: Option<u32>,
    pub shard_count: Option<u32>,
}

impl StructureOverride {
    pub fn apply(&self, base: &IndexStructure) -> IndexStructure {
        let mut structure = base.clone();
        if let Some(ref name) = self.display_name {
            structure.display_name = name.clone();
        }
        if let Some(ref description) = self.description {
            structure.description = description.clone();
        }
        if let Some(ref fields) = self.metadata_fields {
            structure.metadata_fields = fields.clone();
        }
        if let Some(dimensions) = self.dimensions {
            structure.dimensions = dimensions;
        }
        if let Some(ref algorithm) = self.algorithm {
            structure.algorithm = algorithm.clone();
        }
        if let Some(measure) = self.distance_measure {
            structure.distance_measure = measure;
        }
        if let Some(count) = self.approximate_neighbors_count {
            structure.approximate_neighbors_count = count;
        }
        if let Some(shards) = self.shard_count {
            structure.shard_count = shards;
        }
        structure
    }
}

/// Registry of index structures keyed by (entity type, schema version)
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<(EntityType, u32), IndexStructure>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schema v1 for every known entity type
    pub fn with_defaults(dimensions: u32) -> Self {
        let schemas = EntityType::ALL
            .iter()
            .map(|&entity_type| {
                (
                    (entity_type, 1),
                    IndexStructure::default_for(entity_type, 1, dimensions),
                )
            })
            .collect();
        Self { schemas }
    }

    /// Register a structure. Re-registering an identical structure is a no-op;
    /// registering a different one under an existing version is rejected.
    pub fn register(
        &mut self,
        entity_type: EntityType,
        schema_version: u32,
        structure: IndexStructure,
    ) -> VectorResult<()> {
        if schema_version == 0 {
            return Err(VectorError::Validation(
                "Schema versions start at 1".to_string(),
            ));
        }
        structure.validate()?;

        match self.schemas.get(&(entity_type, schema_version)) {
            Some(existing) if *existing == structure => Ok(()),
            Some(_) => Err(VectorError::InvalidOperation(format!(
                "Schema {} v{} is already registered with a different structure; register a new version instead",
                entity_type.as_key(),
                schema_version
            ))),
            None => {
                self.schemas.insert((entity_type, schema_version), structure);
                Ok(())
            }
        }
    }

    pub fn get(&self, entity_type: EntityType, schema_version: u32) -> VectorResult<&IndexStructure> {
        self.schemas
            .get(&(entity_type, schema_version))
            .ok_or_else(|| {
                VectorError::NotFound(format!(
                    "No index schema for {} v{}",
                    entity_type.as_key(),
                    schema_version
                ))
            })
    }

    /// Resolve a structure and apply an optional override
    pub fn resolve(
        &self,
        entity_type: EntityType,
        schema_version: u32,
        custom: Option<&StructureOverride>,
    ) -> VectorResult<IndexStructure> {
        let base = self.get(entity_type, schema_version)?;
        let structure = match custom {
            Some(custom) => custom.apply(base),
            None => base.clone(),
        };
        structure.validate()?;
        Ok(structure)
    }

    pub fn latest_version(&self, entity_type: EntityType) -> Option<u32> {
        self.versions(entity_type).into_iter().max()
    }

    pub fn versions(&self, entity_type: EntityType) -> Vec<u32> {
        self.schemas
            .keys()
            .filter(|(t, _)| *t == entity_type)
            .map(|(_, v)| *v)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_every_entity_type() {
        let registry = SchemaRegistry::with_defaults(DEFAULT_DIMENSION);
        for entity_type in EntityType::ALL {
            let structure = registry.get(entity_type, 1).unwrap();
            assert_eq!(structure.dimensions, 768);
            assert_eq!(structure.metadata_fields[0], "entityId");
            assert_eq!(registry.latest_version(entity_type), Some(1));
        }
    }

    #[test]
    fn test_register_new_version() {
        let mut registry = SchemaRegistry::with_defaults(DEFAULT_DIMENSION);
        let mut v2 = IndexStructure::default_for(EntityType::Character, 2, 1536);
        v2.distance_measure = DistanceMeasure::Cosine;

        registry.register(EntityType::Character, 2, v2).unwrap();

        assert_eq!(registry.latest_version(EntityType::Character), Some(2));
        assert_eq!(registry.versions(EntityType::Character), vec![1, 2]);
        assert_eq!(registry.latest_version(EntityType::Location), Some(1));
    }

    #[test]
    fn test_registered_structure_is_immutable() {
        let mut registry = SchemaRegistry::with_defaults(DEFAULT_DIMENSION);
        let changed = IndexStructure::default_for(EntityType::Item, 1, 1024);

        let err = registry.register(EntityType::Item, 1, changed).unwrap_err();
        assert!(matches!(err, VectorError::InvalidOperation(_)));

        let same = IndexStructure::default_for(EntityType::Item, 1, DEFAULT_DIMENSION);
        assert!(registry.register(EntityType::Item, 1, same).is_ok());
    }

    #[test]
    fn test_missing_schema_is_not_found() {
        let registry = SchemaRegistry::new();
        let err = registry.get(EntityType::Quest, 3).unwrap_err();
        assert!(matches!(err, VectorError::NotFound(_)));
    }

    #[test]
    fn test_resolve_applies_override() {
        let registry = SchemaRegistry::with_defaults(DEFAULT_DIMENSION);
        let custom = StructureOverride {
            shard_count: Some(2),
            algorithm: Some(NeighborAlgorithm::BruteForce),
            ..Default::default()
        };

        let structure = registry
            .resolve(EntityType::Location, 1, Some(&custom))
            .unwrap();

        assert_eq!(structure.shard_count, 2);
        assert_eq!(structure.algorithm, NeighborAlgorithm::BruteForce);
        assert_eq!(structure.dimensions, DEFAULT_DIMENSION);
    }

    #[test]
    fn test_resolve_rejects_invalid_override() {
        let registry = SchemaRegistry::with_defaults(DEFAULT_DIMENSION);
        let custom = StructureOverride {
            dimensions: Some(0),
            ..Default::default()
        };
        assert!(registry.resolve(EntityType::Location, 1, Some(&custom)).is_err());
    }

    #[test]
    fn test_structure_serializes_camel_case() {
        let structure = IndexStructure::default_for(EntityType::Character, 1, 768);
        let json = serde_json::to_value(&structure).unwrap();
        assert_eq!(json["distanceMeasure"], "DOT_PRODUCT");
        assert_eq!(json["algorithm"]["type"], "TREE_AH");
        assert_eq!(json["algorithm"]["leafNodeEmbeddingCount"], 1000);

        let back: IndexStructure = serde_json::from_value(json).unwrap();
        assert_eq!(back, structure);
    }
}
