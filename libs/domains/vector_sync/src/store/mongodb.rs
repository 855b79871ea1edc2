//! MongoDB implementation of DocumentStore
//!
//! Documents are keyed by `_id`. Server timestamps use `$currentDate`, field
//! deletion uses `$unset`, and batches run inside a multi-document
//! transaction, so the deployment must be a replica set.

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::{
    Client, ClientSession, Collection, Database,
    bson::{Bson, Document as BsonDocument, doc},
};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use super::{Condition, Document, DocumentStore, FieldValue, Fields, Filter, Updates, WriteOp};
use crate::error::{VectorError, VectorResult};

pub struct MongoDocumentStore {
    client: Client,
    db: Database,
}

impl MongoDocumentStore {
    pub fn new(client: Client, database: &str) -> Self {
        let db = client.database(database);
        Self { client, db }
    }

    /// Connect and verify the deployment is reachable
    pub async fn connect(config: &core_config::mongodb::MongoConfig) -> VectorResult<Self> {
        info!(database = %config.database, "Connecting to MongoDB");
        let client = Client::with_uri_str(&config.uri).await?;
        client
            .database(&config.database)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| VectorError::Store(format!("MongoDB ping failed: {}", e)))?;
        info!("Connected to MongoDB");
        Ok(Self::new(client, &config.database))
    }

    fn collection(&self, name: &str) -> Collection<BsonDocument> {
        self.db.collection::<BsonDocument>(name)
    }

    fn build_filter(filter: &Filter) -> BsonDocument {
        let mut query = doc! {};
        for condition in filter.conditions() {
            match condition {
                Condition::Eq(field, value) => {
                    query.insert(field.as_str(), json_to_bson(value));
                }
                // $ne also matches documents without the field
                Condition::Ne(field, value) => {
                    query.insert(field.as_str(), doc! { "$ne": json_to_bson(value) });
                }
            }
        }
        query
    }

    fn build_update(updates: &Updates) -> BsonDocument {
        let mut set = doc! {};
        let mut unset = doc! {};
        let mut current_date = doc! {};

        for (field, value) in updates.iter() {
            match value {
                FieldValue::Value(v) => {
                    set.insert(field, json_to_bson(v));
                }
                FieldValue::ServerTimestamp => {
                    current_date.insert(field, true);
                }
                FieldValue::Delete => {
                    unset.insert(field, "");
                }
            }
        }

        let mut update = doc! {};
        if !set.is_empty() {
            update.insert("$set", set);
        }
        if !unset.is_empty() {
            update.insert("$unset", unset);
        }
        if !current_date.is_empty() {
            update.insert("$currentDate", current_date);
        }
        update
    }

    fn to_bson_document(id: &str, fields: &Fields) -> BsonDocument {
        let mut document = BsonDocument::new();
        document.insert("_id", id);
        for (key, value) in fields {
            if key != "_id" {
                document.insert(key.as_str(), json_to_bson(value));
            }
        }
        document
    }

    fn from_bson_document(mut document: BsonDocument) -> Document {
        let id = match document.remove("_id") {
            Some(Bson::String(s)) => s,
            Some(Bson::ObjectId(oid)) => oid.to_hex(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let fields = document
            .into_iter()
            .map(|(k, v)| (k, bson_to_json(v)))
            .collect();
        Document { id, fields }
    }

    async fn apply_in_session(&self, op: &WriteOp, session: &mut ClientSession) -> VectorResult<()> {
        match op {
            WriteOp::Set {
                collection,
                id,
                fields,
            } => {
                self.collection(collection)
                    .replace_one(doc! { "_id": id.as_str() }, Self::to_bson_document(id, fields))
                    .upsert(true)
                    .session(&mut *session)
                    .await?;
            }
            WriteOp::Update {
                collection,
                id,
                updates,
            } => {
                if updates.is_empty() {
                    return Ok(());
                }
                let result = self
                    .collection(collection)
                    .update_one(doc! { "_id": id.as_str() }, Self::build_update(updates))
                    .session(&mut *session)
                    .await?;
                if result.matched_count == 0 {
                    return Err(super::not_found(collection, id));
                }
            }
            WriteOp::UpdateWhere {
                collection,
                filter,
                updates,
            } => {
                if updates.is_empty() {
                    return Ok(());
                }
                self.collection(collection)
                    .update_many(Self::build_filter(filter), Self::build_update(updates))
                    .session(&mut *session)
                    .await?;
            }
            WriteOp::Delete { collection, id } => {
                self.collection(collection)
                    .delete_one(doc! { "_id": id.as_str() })
                    .session(&mut *session)
                    .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MongoDocumentStore {
    #[instrument(skip(self))]
    async fn get(&self, collection: &str, id: &str) -> VectorResult<Option<Document>> {
        let found = self
            .collection(collection)
            .find_one(doc! { "_id": id })
            .await?;
        Ok(found.map(Self::from_bson_document))
    }

    #[instrument(skip(self, fields))]
    async fn set(&self, collection: &str, id: &str, fields: Fields) -> VectorResult<()> {
        self.collection(collection)
            .replace_one(doc! { "_id": id }, Self::to_bson_document(id, &fields))
            .upsert(true)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, updates))]
    async fn update(&self, collection: &str, id: &str, updates: Updates) -> VectorResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let result = self
            .collection(collection)
            .update_one(doc! { "_id": id }, Self::build_update(&updates))
            .await?;
        if result.matched_count == 0 {
            return Err(super::not_found(collection, id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, collection: &str, id: &str) -> VectorResult<bool> {
        let result = self
            .collection(collection)
            .delete_one(doc! { "_id": id })
            .await?;
        Ok(result.deleted_count > 0)
    }

    #[instrument(skip(self, filter))]
    async fn query(&self, collection: &str, filter: Filter) -> VectorResult<Vec<Document>> {
        let cursor = self
            .collection(collection)
            .find(Self::build_filter(&filter))
            .await?;
        let documents: Vec<BsonDocument> = cursor.try_collect().await?;
        debug!(count = documents.len(), "Query returned documents");
        Ok(documents
            .into_iter()
            .map(Self::from_bson_document)
            .collect())
    }

    #[instrument(skip(self, ops), fields(op_count = ops.len()))]
    async fn batch_write(&self, ops: Vec<WriteOp>) -> VectorResult<()> {
        if ops.is_empty() {
            return Ok(());
        }

        let mut session = self.client.start_session().await?;
        session.start_transaction().await?;

        for op in &ops {
            if let Err(e) = self.apply_in_session(op, &mut session).await {
                warn!(collection = op.collection(), error = %e, "Batch write failed, aborting transaction");
                if let Err(abort_err) = session.abort_transaction().await {
                    warn!(error = %abort_err, "Failed to abort transaction");
                }
                return Err(e);
            }
        }

        session.commit_transaction().await?;
        debug!("Batch write committed");
        Ok(())
    }
}

fn json_to_bson(value: &Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Bson::Int64(i),
            None => n.as_f64().map(Bson::Double).unwrap_or(Bson::Null),
        },
        Value::String(s) => Bson::String(s.clone()),
        Value::Array(items) => Bson::Array(items.iter().map(json_to_bson).collect()),
        Value::Object(map) => Bson::Document(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_bson(v)))
                .collect(),
        ),
    }
}

/// Dates become RFC 3339 strings so sync state reads the same from every store
fn bson_to_json(value: Bson) -> Value {
    match value {
        Bson::DateTime(dt) => match dt.try_to_rfc3339_string() {
            Ok(s) => Value::String(s),
            Err(_) => Value::Null,
        },
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::Int32(i) => Value::from(i),
        Bson::Int64(i) => Value::from(i),
        Bson::Array(items) => Value::Array(items.into_iter().map(bson_to_json).collect()),
        Bson::Document(document) => Value::Object(
            document
                .into_iter()
                .map(|(k, v)| (k, bson_to_json(v)))
                .collect::<Map<String, Value>>(),
        ),
        other => other.into_relaxed_extjson(),
    }
}
