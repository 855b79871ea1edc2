//! Document store seam.
//!
//! Entities live one collection per entity type; index metadata lives in
//! [`INDEX_COLLECTION`]. Implementations must support server-assigned
//! timestamps, a field-deletion sentinel and atomic multi-document batches.

mod mongodb;

pub use self::mongodb::MongoDocumentStore;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::error::{VectorError, VectorResult};

/// Collection holding index metadata records
pub const INDEX_COLLECTION: &str = "vectorIndexes";

pub type Fields = Map<String, Value>;

/// A stored document
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }
}

/// Value written by an update
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Value(Value),
    /// Time assigned by the store when the write is applied
    ServerTimestamp,
    /// Remove the field
    Delete,
}

/// Ordered partial update of a document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Updates(Vec<(String, FieldValue)>);

impl Updates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.push((field.into(), FieldValue::Value(value.into())));
        self
    }

    pub fn server_timestamp(mut self, field: impl Into<String>) -> Self {
        self.0.push((field.into(), FieldValue::ServerTimestamp));
        self
    }

    pub fn delete(mut self, field: impl Into<String>) -> Self {
        self.0.push((field.into(), FieldValue::Delete));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.0.iter().rev().find(|(k, _)| k == field).map(|(_, v)| v)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Apply to a field map, resolving server timestamps to `now`
    pub fn apply_to(&self, fields: &mut Fields, now: DateTime<Utc>) {
        for (field, value) in &self.0 {
            match value {
                FieldValue::Value(v) => {
                    fields.insert(field.clone(), v.clone());
                }
                FieldValue::ServerTimestamp => {
                    fields.insert(field.clone(), Value::String(timestamp_string(now)));
                }
                FieldValue::Delete => {
                    fields.remove(field);
                }
            }
        }
    }
}

/// Canonical string form of a stored timestamp
pub fn timestamp_string(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Single field condition
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(String, Value),
    /// Also matches documents that lack the field
    Ne(String, Value),
}

/// Conjunction of field conditions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    /// Matches every document
    pub fn all() -> Self {
        Self::default()
    }

    pub fn equals(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq(field.into(), value.into()));
        self
    }

    pub fn not_equals(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Ne(field.into(), value.into()));
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        self.conditions.iter().all(|condition| match condition {
            Condition::Eq(field, value) => fields.get(field) == Some(value),
            Condition::Ne(field, value) => fields.get(field) != Some(value),
        })
    }
}

/// One write inside an atomic batch
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Set {
        collection: String,
        id: String,
        fields: Fields,
    },
    Update {
        collection: String,
        id: String,
        updates: Updates,
    },
    /// Update every document matching `filter` when the batch is applied
    UpdateWhere {
        collection: String,
        filter: Filter,
        updates: Updates,
    },
    Delete {
        collection: String,
        id: String,
    },
}

impl WriteOp {
    pub fn update(collection: impl Into<String>, id: impl Into<String>, updates: Updates) -> Self {
        WriteOp::Update {
            collection: collection.into(),
            id: id.into(),
            updates,
        }
    }

    pub fn update_where(collection: impl Into<String>, filter: Filter, updates: Updates) -> Self {
        WriteOp::UpdateWhere {
            collection: collection.into(),
            filter,
            updates,
        }
    }

    pub fn collection(&self) -> &str {
        match self {
            WriteOp::Set { collection, .. }
            | WriteOp::Update { collection, .. }
            | WriteOp::UpdateWhere { collection, .. }
            | WriteOp::Delete { collection, .. } => collection,
        }
    }
}

/// Primary document store holding entities and index metadata
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> VectorResult<Option<Document>>;

    /// Create or replace a document
    async fn set(&self, collection: &str, id: &str, fields: Fields) -> VectorResult<()>;

    /// Partially update a document; fails with `NotFound` when it does not exist
    async fn update(&self, collection: &str, id: &str, updates: Updates) -> VectorResult<()>;

    /// Returns whether a document was removed
    async fn delete(&self, collection: &str, id: &str) -> VectorResult<bool>;

    async fn query(&self, collection: &str, filter: Filter) -> VectorResult<Vec<Document>>;

    async fn query_ids(&self, collection: &str, filter: Filter) -> VectorResult<Vec<String>> {
        Ok(self
            .query(collection, filter)
            .await?
            .into_iter()
            .map(|d| d.id)
            .collect())
    }

    /// Apply every operation or none of them
    async fn batch_write(&self, ops: Vec<WriteOp>) -> VectorResult<()>;
}

pub(crate) fn not_found(collection: &str, id: &str) -> VectorError {
    VectorError::NotFound(format!("{}/{}", collection, id))
}
