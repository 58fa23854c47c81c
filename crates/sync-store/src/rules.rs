//! Declarative access predicates, evaluated on every panel-side operation
//! before it reaches the backend. Deny by default: only the rules spelled
//! out here admit anything.
//!
//! The agent never goes through this layer. Its elevated credential is a
//! plain [`StoreBackend`] handle, so "only the agent may write status" is a
//! property of which handle a component holds, not of a predicate that
//! happens to reject ordinary tokens.

use std::sync::Arc;

use harbor_proto::{paths, CommandRecord, CommandStatus};
use serde_json::Value;
use tracing::debug;

use crate::{
    collection_of, split_path, AuthContext, StoreBackend, StoreError, StoreEvent, Subscription,
    SubscriptionLost,
};

/// Read predicate for a document the caller is trying to observe.
pub fn evaluate_read(
    auth: &AuthContext,
    doc_path: &str,
    doc: Option<&Value>,
) -> Result<(), StoreError> {
    match collection_of(doc_path) {
        // Presence is world-readable so any viewer can explain "nothing is
        // happening" as agent downtime.
        "agent" => Ok(()),
        "servers" => {
            let uid = auth
                .uid()
                .ok_or_else(|| StoreError::Denied("sign-in required".into()))?;
            let granted = doc
                .and_then(|doc| doc.get("allowedUsers"))
                .and_then(|users| users.get(uid))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if granted {
                Ok(())
            } else {
                Err(StoreError::Denied(format!(
                    "no access grant on {doc_path}"
                )))
            }
        }
        "commands" => {
            let uid = auth
                .uid()
                .ok_or_else(|| StoreError::Denied("sign-in required".into()))?;
            let requester = doc
                .and_then(|doc| doc.get("requestedBy"))
                .and_then(Value::as_str);
            if requester == Some(uid) {
                Ok(())
            } else {
                Err(StoreError::Denied(format!(
                    "command {doc_path} belongs to another requester"
                )))
            }
        }
        other => Err(StoreError::Denied(format!(
            "collection {other} is not readable"
        ))),
    }
}

/// Create predicate. Only command submission is creatable by users, and
/// only as a complete, well-formed pending record in the caller's own name.
pub fn evaluate_create(
    auth: &AuthContext,
    doc_path: &str,
    incoming: &Value,
) -> Result<(), StoreError> {
    if collection_of(doc_path) != "commands" {
        return Err(StoreError::Denied(format!(
            "{doc_path} is not creatable by clients"
        )));
    }
    let uid = auth
        .uid()
        .ok_or_else(|| StoreError::Denied("sign-in required".into()))?;

    // Completeness and the action enum in one shot: anything that does not
    // parse as a command record is rejected before it can reach storage.
    let record: CommandRecord = serde_json::from_value(incoming.clone())
        .map_err(|err| StoreError::Denied(format!("malformed command record: {err}")))?;

    if record.status != CommandStatus::Pending {
        return Err(StoreError::Denied(
            "new commands must be submitted as pending".into(),
        ));
    }
    if record.requested_by != uid {
        return Err(StoreError::Denied(
            "requestedBy must match the caller identity".into(),
        ));
    }
    if doc_path != paths::command(&record.id) {
        return Err(StoreError::Denied(
            "command id must match its path".into(),
        ));
    }
    Ok(())
}

/// Panel-tier store handle: every operation is gated by the predicates
/// above. Mutation beyond command creation is denied wholesale — outcome
/// appends and status writes belong to the agent's service handle.
#[derive(Clone)]
pub struct GuardedStore {
    backend: Arc<dyn StoreBackend>,
    auth: AuthContext,
}

impl GuardedStore {
    pub fn new(backend: Arc<dyn StoreBackend>, auth: AuthContext) -> Self {
        Self { backend, auth }
    }

    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    pub async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let (doc_path, field) = split_path(path)?;
        let doc = self.backend.get(&doc_path).await?;
        evaluate_read(&self.auth, &doc_path, doc.as_ref())?;
        Ok(match (doc, field) {
            (Some(doc), Some(field)) => doc.get(&field).cloned(),
            (doc, None) => doc,
            (None, Some(_)) => None,
        })
    }

    /// List a collection, silently dropping documents the caller cannot
    /// read. A panel sees exactly its own servers, nothing else.
    pub async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let docs = self.backend.list(collection).await?;
        Ok(docs
            .into_iter()
            .filter(|(path, value)| evaluate_read(&self.auth, path, Some(value)).is_ok())
            .collect())
    }

    pub async fn create(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let (doc_path, field) = split_path(path)?;
        if field.is_some() {
            return Err(StoreError::Denied(format!(
                "{path} is not creatable by clients"
            )));
        }
        evaluate_create(&self.auth, &doc_path, &value)?;
        self.backend.create(&doc_path, value).await
    }

    /// Every client-tier overwrite is denied: command records are
    /// append-only from the agent side and status/presence writes require
    /// the service credential.
    pub async fn put(&self, path: &str, _value: Value) -> Result<(), StoreError> {
        debug!(target: "sync_store::rules", %path, auth = ?self.auth, "client write denied");
        Err(StoreError::Denied(format!(
            "{path} is not writable by clients"
        )))
    }

    pub async fn subscribe(&self, prefix: &str) -> Result<GuardedSubscription, StoreError> {
        let inner = self.backend.subscribe(prefix).await?;
        Ok(GuardedSubscription {
            inner,
            auth: self.auth.clone(),
        })
    }
}

/// Subscription that applies the read predicate to every event, so a
/// viewer only ever observes documents it is granted.
pub struct GuardedSubscription {
    inner: Subscription,
    auth: AuthContext,
}

impl GuardedSubscription {
    pub async fn next(&mut self) -> Result<StoreEvent, SubscriptionLost> {
        loop {
            let event = self.inner.next().await?;
            if evaluate_read(&self.auth, &event.path, Some(&event.value)).is_ok() {
                return Ok(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use harbor_proto::{epoch_millis, CommandAction};
    use serde_json::json;
    use std::time::Duration;

    fn server_doc() -> Value {
        json!({
            "id": "srv1",
            "name": "Main",
            "gameType": "minecraft",
            "description": "",
            "allowedUsers": {"u1": true},
        })
    }

    fn pending_command(id: &str, uid: &str, action: &str) -> Value {
        json!({
            "id": id,
            "serverId": "srv1",
            "action": action,
            "requestedBy": uid,
            "requestedByEmail": format!("{uid}@example.com"),
            "requestedAt": epoch_millis(),
            "status": "pending",
        })
    }

    async fn seeded() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.put("servers/srv1", server_doc()).await.unwrap();
        store
    }

    #[tokio::test]
    async fn read_allowed_only_for_granted_users() {
        let store = seeded().await;

        let u1 = GuardedStore::new(store.clone(), AuthContext::User("u1".into()));
        assert!(u1.get("servers/srv1").await.unwrap().is_some());

        let u2 = GuardedStore::new(store.clone(), AuthContext::User("u2".into()));
        assert!(matches!(
            u2.get("servers/srv1").await,
            Err(StoreError::Denied(_))
        ));

        let anon = GuardedStore::new(store, AuthContext::Anonymous);
        assert!(matches!(
            anon.get("servers/srv1").await,
            Err(StoreError::Denied(_))
        ));
    }

    #[tokio::test]
    async fn status_writes_are_denied_regardless_of_grant() {
        let store = seeded().await;
        let u1 = GuardedStore::new(store, AuthContext::User("u1".into()));
        let err = u1
            .put(
                "servers/srv1/status",
                json!({"state": "running", "lastUpdated": 0, "message": ""}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Denied(_)));
    }

    #[tokio::test]
    async fn command_creation_requires_own_identity() {
        let store = seeded().await;
        let u1 = GuardedStore::new(store, AuthContext::User("u1".into()));

        u1.create("commands/c1", pending_command("c1", "u1", "start"))
            .await
            .unwrap();

        // Impersonation: requestedBy names someone else.
        let err = u1
            .create("commands/c2", pending_command("c2", "u2", "start"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Denied(_)));
    }

    #[tokio::test]
    async fn unknown_action_is_rejected_before_storage() {
        let store = seeded().await;
        let u1 = GuardedStore::new(store.clone(), AuthContext::User("u1".into()));
        let err = u1
            .create("commands/c3", pending_command("c3", "u1", "delete"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Denied(_)));
        // Nothing reached the backend.
        assert!(store.get("commands/c3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn command_mutation_after_creation_is_denied() {
        let store = seeded().await;
        let u1 = GuardedStore::new(store, AuthContext::User("u1".into()));
        u1.create("commands/c4", pending_command("c4", "u1", "stop"))
            .await
            .unwrap();
        let err = u1
            .put("commands/c4", pending_command("c4", "u1", "stop"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Denied(_)));
    }

    #[tokio::test]
    async fn presence_is_world_readable() {
        let store = seeded().await;
        store
            .put(
                "agent/status",
                json!({"online": true, "lastHeartbeat": 0, "version": "0", "hostname": "h"}),
            )
            .await
            .unwrap();
        let anon = GuardedStore::new(store, AuthContext::Anonymous);
        assert!(anon.get("agent/status").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn guarded_subscription_filters_by_grant() {
        let store = seeded().await;
        store
            .put(
                "servers/srv2",
                json!({"id": "srv2", "name": "Other", "gameType": "valheim",
                       "allowedUsers": {"u2": true}}),
            )
            .await
            .unwrap();

        let u1 = GuardedStore::new(store.clone(), AuthContext::User("u1".into()));
        let mut sub = u1.subscribe("servers").await.unwrap();

        // Snapshot yields only srv1; srv2 is invisible to u1.
        let first = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .expect("snapshot event")
            .unwrap();
        assert_eq!(first.path, "servers/srv1");

        // A live status write on srv1 arrives; srv2 updates never do.
        store
            .put("servers/srv2/status", json!({"state": "running"}))
            .await
            .unwrap();
        store
            .put(
                "servers/srv1/status",
                json!({"state": "running", "lastUpdated": 1, "message": ""}),
            )
            .await
            .unwrap();
        let next = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .expect("live event")
            .unwrap();
        assert_eq!(next.path, "servers/srv1");
        assert_eq!(next.value["status"]["state"], "running");
    }

    #[test]
    fn create_predicate_validates_path_against_id() {
        let auth = AuthContext::User("u1".into());
        let record = pending_command("c9", "u1", "start");
        assert!(evaluate_create(&auth, "commands/c9", &record).is_ok());
        assert!(evaluate_create(&auth, "commands/other", &record).is_err());
    }

    #[test]
    fn actions_parse_to_the_fixed_enum_only() {
        assert_eq!(
            "restart".parse::<CommandAction>().unwrap(),
            CommandAction::Restart
        );
        assert!("wipe".parse::<CommandAction>().is_err());
    }
}
