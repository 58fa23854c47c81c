//! Shared real-time store contract: path-addressed documents,
//! last-writer-wins puts, create-only command submission, and push
//! subscriptions that replay the current snapshot before live changes.
//!
//! Two credential tiers exist. The agent holds a [`StoreBackend`] handle
//! directly (the service tier — never exposed to panel code). Panel-side
//! callers only ever hold a [`GuardedStore`], which evaluates the access
//! rules in [`rules`] before any operation reaches the backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

pub mod memory;
pub mod rules;

#[cfg(feature = "redis-backend")]
pub mod redis_store;

pub use memory::MemoryStore;
#[cfg(feature = "redis-backend")]
pub use redis_store::RedisStore;
pub use rules::{GuardedStore, GuardedSubscription};

/// Identity attached to panel-side store operations. The agent's service
/// credential is not an `AuthContext`: it is a different handle type
/// entirely, so no predicate bug can ever grant it to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthContext {
    Anonymous,
    User(String),
}

impl AuthContext {
    pub fn uid(&self) -> Option<&str> {
        match self {
            AuthContext::User(uid) => Some(uid),
            AuthContext::Anonymous => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("access denied: {0}")]
    Denied(String),
    #[error("document already exists at {0}")]
    AlreadyExists(String),
    #[error("invalid store path: {0}")]
    InvalidPath(String),
    #[error("store transport error: {0}")]
    Transport(String),
}

impl StoreError {
    /// Transient errors are retryable; everything else is terminal for the
    /// operation that hit it.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transport(_))
    }
}

/// A change notification: the full document value after the write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreEvent {
    pub path: String,
    pub value: Value,
}

#[derive(Debug, Error)]
pub enum SubscriptionLost {
    #[error("event stream lagged; resubscribe and replay the snapshot")]
    Lagged,
    #[error("store closed the event stream")]
    Closed,
}

/// Handle returned by [`StoreBackend::subscribe`]. Yields the snapshot of
/// matching documents first, then live changes. Dropping the handle is the
/// only unsubscribe path; there is no global listener registry.
pub struct Subscription {
    prefix: String,
    snapshot: std::collections::VecDeque<StoreEvent>,
    rx: broadcast::Receiver<StoreEvent>,
}

impl Subscription {
    pub(crate) fn new(
        prefix: String,
        snapshot: Vec<StoreEvent>,
        rx: broadcast::Receiver<StoreEvent>,
    ) -> Self {
        Self {
            prefix,
            snapshot: snapshot.into(),
            rx,
        }
    }

    pub async fn next(&mut self) -> Result<StoreEvent, SubscriptionLost> {
        if let Some(event) = self.snapshot.pop_front() {
            return Ok(event);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) if path_matches(&self.prefix, &event.path) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    return Err(SubscriptionLost::Lagged)
                }
                Err(broadcast::error::RecvError::Closed) => return Err(SubscriptionLost::Closed),
            }
        }
    }
}

/// Store contract shared by the in-memory and redis backends.
///
/// Paths address documents as `collection/id`; a third segment addresses a
/// single field of the document (`servers/{id}/status`), and writes there
/// merge into the parent document, mirroring the production store.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Read a document, or one field of it for a three-segment path.
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Snapshot of all documents in a collection.
    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>, StoreError>;

    /// Last-writer-wins write of a document or document field.
    async fn put(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Create a document; fails with [`StoreError::AlreadyExists`] if the
    /// path is occupied. The write is atomic: subscribers never observe a
    /// partially-formed document.
    async fn create(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Shallow-merge fields into an existing document.
    async fn merge(&self, path: &str, fields: Value) -> Result<(), StoreError>;

    /// Compare-and-swap claim: if `doc[field] == expected`, merge `update`
    /// and return true; otherwise leave the document untouched and return
    /// false. This is the executor's pending→processing claim step.
    async fn claim(
        &self,
        path: &str,
        field: &str,
        expected: &str,
        update: Value,
    ) -> Result<bool, StoreError>;

    /// Subscribe to a collection or a single document path.
    async fn subscribe(&self, prefix: &str) -> Result<Subscription, StoreError>;
}

pub(crate) fn path_matches(prefix: &str, path: &str) -> bool {
    path == prefix
        || (path.len() > prefix.len()
            && path.starts_with(prefix)
            && path.as_bytes()[prefix.len()] == b'/')
}

/// Split a path into its document path and optional field segment.
pub(crate) fn split_path(path: &str) -> Result<(String, Option<String>), StoreError> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        [collection, id] => Ok((format!("{collection}/{id}"), None)),
        [collection, id, field] => {
            Ok((format!("{collection}/{id}"), Some((*field).to_string())))
        }
        _ => Err(StoreError::InvalidPath(path.to_string())),
    }
}

pub(crate) fn collection_of(doc_path: &str) -> &str {
    doc_path.split('/').next().unwrap_or(doc_path)
}

/// Shallow object merge; non-object targets are replaced wholesale.
pub(crate) fn merge_into(doc: &mut Value, fields: &Value) {
    match (doc.as_object_mut(), fields.as_object()) {
        (Some(target), Some(incoming)) => {
            for (key, value) in incoming {
                target.insert(key.clone(), value.clone());
            }
        }
        _ => *doc = fields.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_prefix_matching_respects_segment_boundaries() {
        assert!(path_matches("commands", "commands/abc"));
        assert!(path_matches("agent/status", "agent/status"));
        assert!(!path_matches("commands", "commandsx/abc"));
        assert!(!path_matches("servers/srv1", "servers/srv10"));
    }

    #[test]
    fn splits_document_and_field_paths() {
        let (doc, field) = split_path("servers/srv1/status").unwrap();
        assert_eq!(doc, "servers/srv1");
        assert_eq!(field.as_deref(), Some("status"));

        let (doc, field) = split_path("agent/status").unwrap();
        assert_eq!(doc, "agent/status");
        assert!(field.is_none());

        assert!(split_path("servers").is_err());
        assert!(split_path("a/b/c/d").is_err());
    }
}
