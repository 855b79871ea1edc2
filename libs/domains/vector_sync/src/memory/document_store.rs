use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{VectorError, VectorResult};
use crate::store::{Document, DocumentStore, Fields, Filter, Updates, WriteOp, not_found};

type Collections = HashMap<String, BTreeMap<String, Fields>>;

/// In-memory document store.
///
/// Batch writes are staged on a copy and swapped in only when every
/// operation succeeded. A failure can be injected at a chosen operation
/// index of the next batch.
#[derive(Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<Collections>,
    fail_batch_at: Mutex<Option<usize>>,
    fail_updates: Mutex<usize>,
    batch_writes: AtomicUsize,
    updates: AtomicUsize,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a document from a JSON object, replacing any existing one
    pub async fn insert(&self, collection: &str, id: &str, value: Value) {
        let fields = match value {
            Value::Object(map) => map,
            _ => Fields::new(),
        };
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), fields);
    }

    pub async fn fields(&self, collection: &str, id: &str) -> Option<Fields> {
        self.collections
            .read()
            .await
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned()
    }

    pub async fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    /// Make the next batch write fail when it reaches operation `index`
    pub fn fail_next_batch_at(&self, index: usize) {
        *lock(&self.fail_batch_at) = Some(index);
    }

    /// Make the next `count` single-document updates fail
    pub fn fail_next_updates(&self, count: usize) {
        *lock(&self.fail_updates) = count;
    }

    pub fn batch_write_count(&self) -> usize {
        self.batch_writes.load(Ordering::SeqCst)
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    fn apply(collections: &mut Collections, op: &WriteOp) -> VectorResult<()> {
        match op {
            WriteOp::Set {
                collection,
                id,
                fields,
            } => {
                collections
                    .entry(collection.clone())
                    .or_default()
                    .insert(id.clone(), fields.clone());
            }
            WriteOp::Update {
                collection,
                id,
                updates,
            } => {
                let document = collections
                    .get_mut(collection)
                    .and_then(|c| c.get_mut(id))
                    .ok_or_else(|| not_found(collection, id))?;
                updates.apply_to(document, Utc::now());
            }
            WriteOp::UpdateWhere {
                collection,
                filter,
                updates,
            } => {
                let now = Utc::now();
                if let Some(documents) = collections.get_mut(collection) {
                    documents
                        .values_mut()
                        .filter(|fields| filter.matches(fields))
                        .for_each(|fields| updates.apply_to(fields, now));
                }
            }
            WriteOp::Delete { collection, id } => {
                if let Some(c) = collections.get_mut(collection) {
                    c.remove(id);
                }
            }
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> VectorResult<Option<Document>> {
        Ok(self
            .fields(collection, id)
            .await
            .map(|fields| Document::new(id, fields)))
    }

    async fn set(&self, collection: &str, id: &str, fields: Fields) -> VectorResult<()> {
        self.insert(collection, id, Value::Object(fields)).await;
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, updates: Updates) -> VectorResult<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        {
            let mut remaining = lock(&self.fail_updates);
            if *remaining > 0 {
                *remaining -= 1;
                return Err(VectorError::Store("injected update failure".to_string()));
            }
        }

        let mut collections = self.collections.write().await;
        Self::apply(&mut collections, &WriteOp::update(collection, id, updates))
    }

    async fn delete(&self, collection: &str, id: &str) -> VectorResult<bool> {
        Ok(self
            .collections
            .write()
            .await
            .get_mut(collection)
            .and_then(|c| c.remove(id))
            .is_some())
    }

    async fn query(&self, collection: &str, filter: Filter) -> VectorResult<Vec<Document>> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .map(|c| {
                c.iter()
                    .filter(|(_, fields)| filter.matches(fields))
                    .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn batch_write(&self, ops: Vec<WriteOp>) -> VectorResult<()> {
        self.batch_writes.fetch_add(1, Ordering::SeqCst);
        let fail_at = lock(&self.fail_batch_at).take();

        let mut collections = self.collections.write().await;
        let mut staged = collections.clone();

        for (index, op) in ops.iter().enumerate() {
            if fail_at == Some(index) {
                return Err(VectorError::Store(format!(
                    "injected batch failure at operation {}",
                    index
                )));
            }
            Self::apply(&mut staged, op)?;
        }

        *collections = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_update_missing_document_is_not_found() {
        let store = MemoryDocumentStore::new();
        let err = store
            .update("characters", "ghost", Updates::new().set("name", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, VectorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_batch_failure_leaves_state_untouched() {
        let store = MemoryDocumentStore::new();
        store.insert("items", "a", json!({ "active": true })).await;
        store.insert("items", "b", json!({ "active": false })).await;

        store.fail_next_batch_at(1);
        let ops = vec![
            WriteOp::update("items", "a", Updates::new().set("active", false)),
            WriteOp::update("items", "b", Updates::new().set("active", true)),
        ];
        assert!(store.batch_write(ops.clone()).await.is_err());

        assert_eq!(store.fields("items", "a").await.unwrap()["active"], true);
        assert_eq!(store.fields("items", "b").await.unwrap()["active"], false);

        // injection is one-shot
        store.batch_write(ops).await.unwrap();
        assert_eq!(store.fields("items", "a").await.unwrap()["active"], false);
        assert_eq!(store.fields("items", "b").await.unwrap()["active"], true);
        assert_eq!(store.batch_write_count(), 2);
    }

    #[tokio::test]
    async fn test_update_where_sees_documents_present_at_commit() {
        let store = MemoryDocumentStore::new();
        store.insert("indexes", "v1", json!({ "type": "ITEM", "active": true })).await;
        store.insert("indexes", "v2", json!({ "type": "ITEM", "active": false })).await;
        store.insert("indexes", "q1", json!({ "type": "QUEST", "active": true })).await;

        store
            .batch_write(vec![
                WriteOp::update_where(
                    "indexes",
                    Filter::all().equals("type", "ITEM"),
                    Updates::new().set("active", false),
                ),
                WriteOp::update("indexes", "v2", Updates::new().set("active", true)),
            ])
            .await
            .unwrap();

        assert_eq!(store.fields("indexes", "v1").await.unwrap()["active"], false);
        assert_eq!(store.fields("indexes", "v2").await.unwrap()["active"], true);
        assert_eq!(store.fields("indexes", "q1").await.unwrap()["active"], true);
    }

    #[tokio::test]
    async fn test_query_with_filter() {
        let store = MemoryDocumentStore::new();
        store.insert("notes", "n1", json!({ "vectorStatus": "COMPLETED" })).await;
        store.insert("notes", "n2", json!({ "vectorStatus": "FAILED" })).await;
        store.insert("notes", "n3", json!({ "name": "fresh" })).await;

        let ids = store
            .query_ids("notes", Filter::all().not_equals("vectorStatus", "COMPLETED"))
            .await
            .unwrap();
        assert_eq!(ids, vec!["n2", "n3"]);
    }

    #[tokio::test]
    async fn test_injected_update_failure() {
        let store = MemoryDocumentStore::new();
        store.insert("notes", "n1", json!({})).await;
        store.fail_next_updates(1);

        assert!(store.update("notes", "n1", Updates::new().set("a", 1)).await.is_err());
        assert!(store.update("notes", "n1", Updates::new().set("a", 1)).await.is_ok());
        assert_eq!(store.update_count(), 2);
    }
}
