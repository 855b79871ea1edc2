use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString};

use crate::error::{VectorError, VectorResult};
use crate::schema::IndexStructure;

/// Field names of the sync state carried on every entity document
pub mod fields {
    pub const VECTOR_ID: &str = "vectorId";
    pub const VECTOR_STATUS: &str = "vectorStatus";
    pub const VECTOR_TIMESTAMP: &str = "vectorTimestamp";
    pub const VECTOR_ERROR: &str = "vectorError";
    pub const SCHEMA_VERSION: &str = "schemaVersion";
    pub const UPDATED_AT: &str = "updatedAt";
    pub const CREATED_AT: &str = "createdAt";

    /// Every field written by the synchronizer
    pub const SYNC_FIELDS: &[&str] = &[
        VECTOR_ID,
        VECTOR_STATUS,
        VECTOR_TIMESTAMP,
        VECTOR_ERROR,
        SCHEMA_VERSION,
    ];
}

/// Kind of campaign entity kept in the document store
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum EntityType {
    Character,
    Location,
    Item,
    Faction,
    Quest,
    Event,
    Session,
    Note,
}

impl EntityType {
    pub const ALL: [EntityType; 8] = [
        EntityType::Character,
        EntityType::Location,
        EntityType::Item,
        EntityType::Faction,
        EntityType::Quest,
        EntityType::Event,
        EntityType::Session,
        EntityType::Note,
    ];

    /// Lowercase key used in index keys and resource names
    pub fn as_key(&self) -> &'static str {
        match self {
            EntityType::Character => "character",
            EntityType::Location => "location",
            EntityType::Item => "item",
            EntityType::Faction => "faction",
            EntityType::Quest => "quest",
            EntityType::Event => "event",
            EntityType::Session => "session",
            EntityType::Note => "note",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            EntityType::Character => "Character",
            EntityType::Location => "Location",
            EntityType::Item => "Item",
            EntityType::Faction => "Faction",
            EntityType::Quest => "Quest",
            EntityType::Event => "Event",
            EntityType::Session => "Session",
            EntityType::Note => "Note",
        }
    }

    /// Document store collection holding entities of this type
    pub fn collection(&self) -> &'static str {
        match self {
            EntityType::Character => "characters",
            EntityType::Location => "locations",
            EntityType::Item => "items",
            EntityType::Faction => "factions",
            EntityType::Quest => "quests",
            EntityType::Event => "events",
            EntityType::Session => "sessions",
            EntityType::Note => "notes",
        }
    }
}

/// Synchronization status of an entity's vector
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum VectorStatus {
    Pending,
    Completed,
    Failed,
}

/// Sync fields read from an entity document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySyncState {
    #[serde(default)]
    pub vector_id: Option<String>,
    #[serde(default)]
    pub vector_status: Option<VectorStatus>,
    #[serde(default)]
    pub vector_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub vector_error: Option<String>,
    #[serde(default)]
    pub schema_version: Option<u32>,
}

impl EntitySyncState {
    /// COMPLETED with both a vector id and a timestamp
    pub fn is_synced(&self) -> bool {
        self.vector_status == Some(VectorStatus::Completed)
            && self.vector_id.is_some()
            && self.vector_timestamp.is_some()
    }
}

/// An entity document as seen by the synchronizer
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: String,
    pub entity_type: EntityType,
    pub fields: Map<String, Value>,
    pub sync: EntitySyncState,
}

impl Entity {
    pub fn new(id: impl Into<String>, entity_type: EntityType, fields: Map<String, Value>) -> Self {
        let sync = EntitySyncState::from_fields(&fields);
        Self {
            id: id.into(),
            entity_type,
            fields,
            sync,
        }
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Scalar field rendered as a string, as used in metadata restricts
    pub fn field_string(&self, name: &str) -> Option<String> {
        match self.fields.get(name)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other @ (Value::Bool(_) | Value::Number(_)) => Some(other.to_string()),
            _ => None,
        }
    }
}

/// Reference to an entity document
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub entity_id: String,
    pub entity_type: EntityType,
}

impl EntityRef {
    pub fn new(entity_id: impl Into<String>, entity_type: EntityType) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_type,
        }
    }
}

impl EntitySyncState {
    /// Read sync fields from a raw document. Malformed values are treated as absent.
    pub fn from_fields(fields: &Map<String, Value>) -> Self {
        let vector_status = fields
            .get(fields::VECTOR_STATUS)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok());
        let vector_timestamp = fields
            .get(fields::VECTOR_TIMESTAMP)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Self {
            vector_id: fields
                .get(fields::VECTOR_ID)
                .and_then(Value::as_str)
                .map(str::to_string),
            vector_status,
            vector_timestamp,
            vector_error: fields
                .get(fields::VECTOR_ERROR)
                .and_then(Value::as_str)
                .map(str::to_string),
            schema_version: fields
                .get(fields::SCHEMA_VERSION)
                .and_then(Value::as_u64)
                .and_then(|v| u32::try_from(v).ok()),
        }
    }
}

/// Outcome of one synchronization attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub success: bool,
    /// The entity was already in sync and nothing was called
    #[serde(default)]
    pub skipped: bool,
    pub vector_id: Option<String>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl SyncResult {
    pub fn synced(entity_id: &str, entity_type: EntityType, vector_id: String) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            entity_type,
            success: true,
            skipped: false,
            vector_id: Some(vector_id),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn already_synced(entity_id: &str, entity_type: EntityType, vector_id: Option<String>) -> Self {
        Self {
            skipped: true,
            vector_id,
            ..Self::synced(entity_id, entity_type, String::new())
        }
    }

    pub fn failed(entity_id: &str, entity_type: EntityType, error: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            entity_type,
            success: false,
            skipped: false,
            vector_id: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

/// Options for a single entity sync
#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// Re-embed even when the entity is already COMPLETED
    pub force: bool,
    pub update_vector_counts: bool,
    pub create_index_if_not_exists: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            force: false,
            update_vector_counts: true,
            create_index_if_not_exists: true,
        }
    }
}

impl SyncOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }
}

/// Options for bulk synchronization of one entity type
#[derive(Debug, Clone, Copy)]
pub struct BulkSyncOptions {
    pub force: bool,
    pub batch_size: usize,
    /// Entities synced at once inside a chunk; 1 is strictly sequential
    pub concurrency: usize,
    pub update_vector_counts: bool,
}

impl Default for BulkSyncOptions {
    fn default() -> Self {
        Self {
            force: false,
            batch_size: 50,
            concurrency: 1,
            update_vector_counts: true,
        }
    }
}

impl BulkSyncOptions {
    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            force: self.force,
            update_vector_counts: self.update_vector_counts,
            create_index_if_not_exists: true,
        }
    }
}

/// Aggregate over many sync results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub entity_type: Option<EntityType>,
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failed_ids: Vec<String>,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
    pub duration_ms: i64,
}

impl SyncSummary {
    pub fn start(entity_type: Option<EntityType>) -> Self {
        let now = Utc::now();
        Self {
            entity_type,
            total: 0,
            success: 0,
            failed: 0,
            skipped: 0,
            failed_ids: Vec::new(),
            start_timestamp: now,
            end_timestamp: now,
            duration_ms: 0,
        }
    }

    pub fn record(&mut self, result: &SyncResult) {
        self.total += 1;
        if result.success {
            self.success += 1;
            if result.skipped {
                self.skipped += 1;
            }
        } else {
            self.failed += 1;
            self.failed_ids.push(result.entity_id.clone());
        }
    }

    pub fn finish(mut self) -> Self {
        self.end_timestamp = Utc::now();
        self.duration_ms = (self.end_timestamp - self.start_timestamp).num_milliseconds();
        self
    }

    pub fn from_results(entity_type: Option<EntityType>, results: &[SyncResult]) -> Self {
        let mut summary = Self::start(entity_type);
        results.iter().for_each(|r| summary.record(r));
        summary.finish()
    }
}

/// Per-entity outcome inside a batch vector operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemResult {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub success: bool,
    pub vector_id: Option<String>,
    pub error: Option<String>,
}

/// Aggregate outcome of a batch vector operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOperationResult {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub failed_ids: Vec<String>,
    pub items: Vec<BatchItemResult>,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
    pub duration_ms: i64,
}

impl BatchOperationResult {
    pub fn from_items(start_timestamp: DateTime<Utc>, items: Vec<BatchItemResult>) -> Self {
        let end_timestamp = Utc::now();
        let failed_ids: Vec<String> = items
            .iter()
            .filter(|i| !i.success)
            .map(|i| i.entity_id.clone())
            .collect();
        Self {
            total: items.len(),
            success: items.len() - failed_ids.len(),
            failed: failed_ids.len(),
            failed_ids,
            items,
            start_timestamp,
            end_timestamp,
            duration_ms: (end_timestamp - start_timestamp).num_milliseconds(),
        }
    }
}

/// Metadata carried alongside a vector, encoded as `key=value` restricts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorMetadata(BTreeMap<String, String>);

impl VectorMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata for an entity at a schema version
    pub fn for_entity(entity: &Entity, schema_version: u32) -> Self {
        let mut metadata = Self::new()
            .with("entityId", entity.id.clone())
            .with("entityType", entity.entity_type.to_string())
            .with("schemaVersion", schema_version.to_string());
        for key in ["worldId", "campaignId", fields::CREATED_AT, fields::UPDATED_AT] {
            if let Some(value) = entity.field_string(key) {
                metadata.insert(key, value);
            }
        }
        metadata
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn entity_id(&self) -> Option<&str> {
        self.get("entityId")
    }

    pub fn schema_version(&self) -> Option<u32> {
        self.get("schemaVersion").and_then(|v| v.parse().ok())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Restricts for the fields an index carries, in the index's field order
    pub fn to_restricts(&self, metadata_fields: &[String]) -> Vec<String> {
        metadata_fields
            .iter()
            .filter_map(|field| self.0.get(field).map(|value| format!("{}={}", field, value)))
            .collect()
    }

    /// Rebuild metadata from restricts. Entries without `=` are ignored.
    pub fn from_restricts<S: AsRef<str>>(restricts: &[S]) -> Self {
        let values = restricts
            .iter()
            .filter_map(|r| {
                let (key, value) = r.as_ref().split_once('=')?;
                Some((key.to_string(), value.to_string()))
            })
            .collect();
        Self(values)
    }
}

/// Lifecycle status of a vector index
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexStatus {
    Creating,
    Ready,
    Updating,
    Deleting,
    Error,
}

/// Build the metadata record key `<environment>-<entityType>-v<schemaVersion>`
pub fn index_key(environment: &str, entity_type: EntityType, schema_version: u32) -> String {
    format!("{}-{}-v{}", environment, entity_type.as_key(), schema_version)
}

/// Index metadata record, one per (entity type, schema version, environment)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMetadata {
    pub index_id: String,
    /// Resource name assigned by the vector index service
    #[serde(default)]
    pub resource_name: Option<String>,
    pub entity_type: EntityType,
    pub schema_version: u32,
    pub environment: String,
    pub status: IndexStatus,
    #[serde(default)]
    pub vector_count: u64,
    pub structure: IndexStructure,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub endpoint_id: Option<String>,
    #[serde(default)]
    pub deployed_index_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl IndexMetadata {
    pub fn from_fields(fields: Map<String, Value>) -> VectorResult<Self> {
        serde_json::from_value(Value::Object(fields)).map_err(|e| {
            VectorError::Internal(format!("Malformed index metadata record: {}", e))
        })
    }

    pub fn to_fields(&self) -> VectorResult<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(VectorError::Internal(
                "Index metadata did not serialize to an object".to_string(),
            )),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == IndexStatus::Ready
    }

    pub fn is_deployed(&self) -> bool {
        self.endpoint_id.is_some() && self.deployed_index_id.is_some()
    }
}

/// Filter for listing index metadata records
#[derive(Debug, Clone, Default)]
pub struct IndexQuery {
    pub entity_type: Option<EntityType>,
    pub status: Option<IndexStatus>,
    pub active: Option<bool>,
    pub schema_version: Option<u32>,
}

impl IndexQuery {
    pub fn for_type(entity_type: EntityType) -> Self {
        Self {
            entity_type: Some(entity_type),
            ..Default::default()
        }
    }

    pub fn matches(&self, metadata: &IndexMetadata) -> bool {
        self.entity_type.is_none_or(|t| t == metadata.entity_type)
            && self.status.is_none_or(|s| s == metadata.status)
            && self.active.is_none_or(|a| a == metadata.active)
            && self
                .schema_version
                .is_none_or(|v| v == metadata.schema_version)
    }
}

/// Per entity type statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityIndexStatistics {
    pub entity_type: EntityType,
    pub index_count: usize,
    pub active_schema_version: Option<u32>,
    /// Count kept on the metadata record
    pub stored_vector_count: u64,
    /// Count reported by the vector index service, when it could be read
    pub live_vector_count: Option<u64>,
}

/// Statistics over index metadata records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStatistics {
    pub environment: String,
    pub total_indexes: usize,
    pub by_status: BTreeMap<String, usize>,
    pub total_vectors: u64,
    pub entity_types: Vec<EntityIndexStatistics>,
}
