//! Panel-side client for the Harbor control plane.
//!
//! The dispatcher turns a user-initiated intent into a validated command
//! record in the shared store; the viewer half renders ground truth from
//! status, command and presence subscriptions. Neither ever mutates server
//! status — the agent is the only writer of execution outcomes.

use harbor_proto::{epoch_millis, paths, CommandAction, CommandRecord, CommandStatus, ServerRecord};
use sync_store::{GuardedStore, StoreError};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub mod viewer;

pub use viewer::{CommandProgress, Viewer};

/// Identity assertion from the external identity provider.
#[derive(Debug, Clone)]
pub struct PanelIdentity {
    pub user_id: String,
    pub email: String,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The caller has no grant on this server (or the server does not
    /// exist — indistinguishable by design).
    #[error("not authorized for this server")]
    NotAuthorized,
    /// The store could not take the write; the submission may be retried.
    #[error("transient store failure: {0}")]
    Transient(String),
}

impl From<StoreError> for DispatchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Denied(_) => DispatchError::NotAuthorized,
            other => DispatchError::Transient(other.to_string()),
        }
    }
}

/// Turns user intent into pending command records. Owns idempotency-key
/// generation: every submission gets a fresh unguessable id.
pub struct Dispatcher {
    store: GuardedStore,
    identity: PanelIdentity,
}

impl Dispatcher {
    pub fn new(store: GuardedStore, identity: PanelIdentity) -> Self {
        Self { store, identity }
    }

    /// Submit one privileged action against one server.
    ///
    /// Returns the command id for correlation; a returned id means
    /// "requested", never "done" — status convergence arrives through the
    /// command and status subscriptions.
    pub async fn submit(
        &self,
        server_id: &str,
        action: CommandAction,
    ) -> Result<String, DispatchError> {
        // Fail fast on a local grant check before attempting the write.
        // The store predicate is the real gate; this just produces a clear
        // error without a rejected round trip.
        let doc = self.store.get(&paths::server(server_id)).await?;
        let server: ServerRecord = doc
            .and_then(|doc| serde_json::from_value(doc).ok())
            .ok_or(DispatchError::NotAuthorized)?;
        if !server.grants_access(&self.identity.user_id) {
            warn!(
                target: "panel_sdk",
                server = %server_id,
                user = %self.identity.user_id,
                "submit blocked by local grant check"
            );
            return Err(DispatchError::NotAuthorized);
        }

        let command_id = Uuid::new_v4().to_string();
        let record = CommandRecord {
            id: command_id.clone(),
            server_id: server_id.to_string(),
            action,
            requested_by: self.identity.user_id.clone(),
            requested_by_email: self.identity.email.clone(),
            requested_at: epoch_millis(),
            status: CommandStatus::Pending,
            processed_at: None,
            result: None,
            error: None,
        };
        let value = serde_json::to_value(&record)
            .map_err(|err| DispatchError::Transient(err.to_string()))?;

        // One atomic create: the agent's subscription never observes a
        // partially-formed record.
        self.store.create(&paths::command(&command_id), value).await?;

        info!(
            target: "panel_sdk",
            command = %command_id,
            server = %server_id,
            action = action.as_str(),
            user = %self.identity.user_id,
            "command submitted"
        );
        Ok(command_id)
    }
}
