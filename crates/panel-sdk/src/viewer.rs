//! Read-side helpers for panels: subscriptions to servers and commands,
//! presence interpretation, and the triage that explains an apparently
//! idle command as failed, still in flight, or waiting on a dead agent.

use harbor_proto::{paths, CommandRecord, CommandStatus, PresenceRecord, ServerRecord};
use sync_store::{GuardedStore, GuardedSubscription, StoreError};

pub struct Viewer {
    store: GuardedStore,
}

impl Viewer {
    pub fn new(store: GuardedStore) -> Self {
        Self { store }
    }

    pub async fn server(&self, server_id: &str) -> Result<Option<ServerRecord>, StoreError> {
        let doc = self.store.get(&paths::server(server_id)).await?;
        Ok(doc.and_then(|doc| serde_json::from_value(doc).ok()))
    }

    /// Subscribe to every server this identity can read. Yields current
    /// records first, then live changes as the agent converges status.
    pub async fn watch_servers(&self) -> Result<GuardedSubscription, StoreError> {
        self.store.subscribe(paths::SERVERS).await
    }

    /// Subscribe to this identity's own command records for audit display.
    pub async fn watch_commands(&self) -> Result<GuardedSubscription, StoreError> {
        self.store.subscribe(paths::COMMANDS).await
    }

    pub async fn presence(&self) -> Result<Option<PresenceRecord>, StoreError> {
        let doc = self.store.get(paths::PRESENCE).await?;
        Ok(doc.and_then(|doc| serde_json::from_value(doc).ok()))
    }
}

/// Why a submitted command has produced no visible effect yet. The three
/// idle cases are distinct on purpose: "failed", "still pending" and
/// "agent offline" call for different operator reactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandProgress {
    Completed { result: Option<String> },
    Failed { error: Option<String> },
    /// The agent is live and the command is pending or processing.
    InFlight(CommandStatus),
    /// No live heartbeat: the command may sit pending until it expires.
    AgentOffline,
}

pub fn explain_command(
    command: &CommandRecord,
    presence: Option<&PresenceRecord>,
    now: i64,
) -> CommandProgress {
    match command.status {
        CommandStatus::Completed => CommandProgress::Completed {
            result: command.result.clone(),
        },
        CommandStatus::Failed => CommandProgress::Failed {
            error: command.error.clone(),
        },
        status => {
            let agent_online = presence.map(|p| p.is_online(now)).unwrap_or(false);
            if agent_online {
                CommandProgress::InFlight(status)
            } else {
                CommandProgress::AgentOffline
            }
        }
    }
}
