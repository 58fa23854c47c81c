//! In-memory backend for tests, local development and embedded
//! deployments. Fan-out uses a single broadcast channel; subscriptions
//! filter by path prefix and replay the current snapshot first, matching
//! the production store's resubscribe semantics.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::{
    merge_into, path_matches, split_path, StoreBackend, StoreError, StoreEvent, Subscription,
};

const EVENT_CAPACITY: usize = 256;

pub struct MemoryStore {
    docs: parking_lot::RwLock<BTreeMap<String, Value>>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            docs: parking_lot::RwLock::new(BTreeMap::new()),
            events,
        }
    }

    fn emit(&self, path: &str, value: &Value) {
        // Nobody listening is fine; send only fails without receivers.
        let _ = self.events.send(StoreEvent {
            path: path.to_string(),
            value: value.clone(),
        });
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let (doc_path, field) = split_path(path)?;
        let docs = self.docs.read();
        let doc = docs.get(&doc_path);
        Ok(match (doc, field) {
            (Some(doc), None) => Some(doc.clone()),
            (Some(doc), Some(field)) => doc.get(&field).cloned(),
            (None, _) => None,
        })
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let docs = self.docs.read();
        Ok(docs
            .iter()
            .filter(|(path, _)| path_matches(collection, path))
            .map(|(path, value)| (path.clone(), value.clone()))
            .collect())
    }

    async fn put(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let (doc_path, field) = split_path(path)?;
        let mut docs = self.docs.write();
        let updated = match field {
            None => {
                docs.insert(doc_path.clone(), value);
                docs.get(&doc_path).cloned().unwrap_or(Value::Null)
            }
            Some(field) => {
                let doc = docs
                    .entry(doc_path.clone())
                    .or_insert_with(|| Value::Object(Default::default()));
                merge_into(doc, &serde_json::json!({ field: value }));
                doc.clone()
            }
        };
        drop(docs);
        self.emit(&doc_path, &updated);
        Ok(())
    }

    async fn create(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let (doc_path, field) = split_path(path)?;
        if field.is_some() {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        let mut docs = self.docs.write();
        if docs.contains_key(&doc_path) {
            return Err(StoreError::AlreadyExists(doc_path));
        }
        docs.insert(doc_path.clone(), value.clone());
        drop(docs);
        self.emit(&doc_path, &value);
        Ok(())
    }

    async fn merge(&self, path: &str, fields: Value) -> Result<(), StoreError> {
        let (doc_path, field) = split_path(path)?;
        if field.is_some() {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        let mut docs = self.docs.write();
        let doc = docs
            .entry(doc_path.clone())
            .or_insert_with(|| Value::Object(Default::default()));
        merge_into(doc, &fields);
        let updated = doc.clone();
        drop(docs);
        self.emit(&doc_path, &updated);
        Ok(())
    }

    async fn claim(
        &self,
        path: &str,
        field: &str,
        expected: &str,
        update: Value,
    ) -> Result<bool, StoreError> {
        let (doc_path, subfield) = split_path(path)?;
        if subfield.is_some() {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        let mut docs = self.docs.write();
        let Some(doc) = docs.get_mut(&doc_path) else {
            return Ok(false);
        };
        if doc.get(field).and_then(Value::as_str) != Some(expected) {
            return Ok(false);
        }
        merge_into(doc, &update);
        let updated = doc.clone();
        drop(docs);
        self.emit(&doc_path, &updated);
        Ok(true)
    }

    async fn subscribe(&self, prefix: &str) -> Result<Subscription, StoreError> {
        // Subscribe before snapshotting so no write can fall between them.
        let rx = self.events.subscribe();
        let docs = self.docs.read();
        let snapshot = docs
            .iter()
            .filter(|(path, _)| path_matches(prefix, path))
            .map(|(path, value)| StoreEvent {
                path: path.clone(),
                value: value.clone(),
            })
            .collect();
        drop(docs);
        Ok(Subscription::new(prefix.to_string(), snapshot, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn put_and_get_round_trip() {
        let store = MemoryStore::new();
        store
            .put("servers/srv1", json!({"id": "srv1", "name": "Main"}))
            .await
            .unwrap();
        let doc = store.get("servers/srv1").await.unwrap().unwrap();
        assert_eq!(doc["name"], "Main");
        assert!(store.get("servers/other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn field_path_writes_merge_into_the_document() {
        let store = MemoryStore::new();
        store
            .put("servers/srv1", json!({"id": "srv1", "name": "Main"}))
            .await
            .unwrap();
        store
            .put(
                "servers/srv1/status",
                json!({"state": "running", "lastUpdated": 5, "message": ""}),
            )
            .await
            .unwrap();
        let doc = store.get("servers/srv1").await.unwrap().unwrap();
        assert_eq!(doc["name"], "Main");
        assert_eq!(doc["status"]["state"], "running");
        let status = store.get("servers/srv1/status").await.unwrap().unwrap();
        assert_eq!(status["state"], "running");
    }

    #[tokio::test]
    async fn create_rejects_overwrite() {
        let store = MemoryStore::new();
        store
            .create("commands/c1", json!({"status": "pending"}))
            .await
            .unwrap();
        let err = store
            .create("commands/c1", json!({"status": "pending"}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn claim_swaps_exactly_once() {
        let store = MemoryStore::new();
        store
            .create("commands/c1", json!({"id": "c1", "status": "pending"}))
            .await
            .unwrap();

        let claimed = store
            .claim(
                "commands/c1",
                "status",
                "pending",
                json!({"status": "processing", "processedAt": 1}),
            )
            .await
            .unwrap();
        assert!(claimed);

        // Second claimant loses: the field no longer matches.
        let claimed_again = store
            .claim(
                "commands/c1",
                "status",
                "pending",
                json!({"status": "processing"}),
            )
            .await
            .unwrap();
        assert!(!claimed_again);

        let doc = store.get("commands/c1").await.unwrap().unwrap();
        assert_eq!(doc["status"], "processing");
        assert_eq!(doc["processedAt"], 1);
    }

    #[tokio::test]
    async fn subscribe_replays_snapshot_then_live_changes() {
        let store = MemoryStore::new();
        store
            .create("commands/c1", json!({"id": "c1", "status": "pending"}))
            .await
            .unwrap();

        let mut sub = store.subscribe("commands").await.unwrap();

        // Snapshot first.
        let first = sub.next().await.unwrap();
        assert_eq!(first.path, "commands/c1");

        // Then the live write; unrelated paths are filtered out.
        store
            .put("servers/srv1", json!({"id": "srv1"}))
            .await
            .unwrap();
        store
            .create("commands/c2", json!({"id": "c2", "status": "pending"}))
            .await
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .expect("event before timeout")
            .unwrap();
        assert_eq!(second.path, "commands/c2");
    }
}
