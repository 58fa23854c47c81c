//! Shared protocol definitions for panel ↔ store ↔ agent communication.
//! Keeping this in a dedicated crate allows the panel SDK and the agent to
//! agree on wire shapes without pulling in heavier runtime code.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

pub mod paths;

/// A presence record older than this must be read as offline, regardless of
/// the stored `online` flag.
pub const PRESENCE_STALE_AFTER_MS: i64 = 90_000;

/// Commands whose `requestedAt` is older than this window are expired and
/// must never be executed.
pub const COMMAND_FRESHNESS_WINDOW_MS: i64 = 300_000;

/// Graceful-stop wait before the supervisor force-kills a server process.
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 30;

/// Current wall clock as epoch milliseconds, the timestamp unit used on
/// every wire record.
pub fn epoch_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Error)]
#[error("unknown value `{value}` for {kind}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// The fixed set of privileged actions a panel may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandAction {
    Start,
    Stop,
    Restart,
}

impl CommandAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandAction::Start => "start",
            CommandAction::Stop => "stop",
            CommandAction::Restart => "restart",
        }
    }
}

impl FromStr for CommandAction {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(CommandAction::Start),
            "stop" => Ok(CommandAction::Stop),
            "restart" => Ok(CommandAction::Restart),
            other => Err(ParseEnumError {
                kind: "command action",
                value: other.to_string(),
            }),
        }
    }
}

/// Lifecycle of a command record. Transitions only ever move forward:
/// pending → processing → completed | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Processing => "processing",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandStatus::Completed | CommandStatus::Failed)
    }

    /// The only legal forward edges of the command lifecycle.
    pub fn can_transition(from: CommandStatus, to: CommandStatus) -> bool {
        matches!(
            (from, to),
            (CommandStatus::Pending, CommandStatus::Processing)
                | (CommandStatus::Processing, CommandStatus::Completed)
                | (CommandStatus::Processing, CommandStatus::Failed)
        )
    }
}

/// A recorded request to perform one privileged action on one server.
/// Written once by the panel; only the status/result/error/processedAt
/// fields are ever appended afterwards, and only by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub id: String,
    pub server_id: String,
    pub action: CommandAction,
    pub requested_by: String,
    pub requested_by_email: String,
    pub requested_at: i64,
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandRecord {
    /// Age of the request relative to `now`, in milliseconds. Negative ages
    /// (client clock ahead of ours) are treated as zero.
    pub fn age_ms(&self, now: i64) -> i64 {
        (now - self.requested_at).max(0)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.age_ms(now) > COMMAND_FRESHNESS_WINDOW_MS
    }
}

/// Observable lifecycle of a supervised server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
            ServerState::Error => "error",
        }
    }

    /// Single authority for legal state-machine edges. `error` is terminal
    /// until a retried start; anything not listed here is illegal.
    pub fn can_transition(from: ServerState, to: ServerState) -> bool {
        matches!(
            (from, to),
            (ServerState::Stopped, ServerState::Starting)
                | (ServerState::Error, ServerState::Starting)
                | (ServerState::Starting, ServerState::Running)
                | (ServerState::Starting, ServerState::Error)
                | (ServerState::Running, ServerState::Stopping)
                | (ServerState::Running, ServerState::Error)
                | (ServerState::Stopping, ServerState::Stopped)
        )
    }
}

/// Per-server status document, written exclusively by the agent at
/// `servers/{id}/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    pub state: ServerState,
    pub last_updated: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Launch configuration carried on the server record for display; the agent
/// acts only on its own local copy of the same shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchSpec {
    pub executable_path: String,
    pub working_directory: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_command: Option<String>,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: u64,
}

fn default_stop_timeout() -> u64 {
    DEFAULT_STOP_TIMEOUT_SECS
}

/// A managed server as stored at `servers/{id}`. `allowed_users` is the
/// entire access model: presence of a uid with `true` grants read access.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub id: String,
    pub name: String,
    pub game_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub allowed_users: std::collections::HashMap<String, bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<LaunchSpec>,
}

impl ServerRecord {
    pub fn grants_access(&self, uid: &str) -> bool {
        self.allowed_users.get(uid).copied().unwrap_or(false)
    }
}

/// Agent liveness signal at `agent/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub online: bool,
    pub last_heartbeat: i64,
    pub version: String,
    pub hostname: String,
}

impl PresenceRecord {
    /// Reader-side staleness rule: a heartbeat older than
    /// [`PRESENCE_STALE_AFTER_MS`] means offline no matter what was stored.
    pub fn is_online(&self, now: i64) -> bool {
        self.online && now - self.last_heartbeat <= PRESENCE_STALE_AFTER_MS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_record_uses_camel_case_wire_names() {
        let record = CommandRecord {
            id: "cmd-1".into(),
            server_id: "srv1".into(),
            action: CommandAction::Start,
            requested_by: "u1".into(),
            requested_by_email: "u1@example.com".into(),
            requested_at: 1_700_000_000_000,
            status: CommandStatus::Pending,
            processed_at: None,
            result: None,
            error: None,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["serverId"], "srv1");
        assert_eq!(value["action"], "start");
        assert_eq!(value["requestedBy"], "u1");
        assert_eq!(value["requestedByEmail"], "u1@example.com");
        assert_eq!(value["status"], "pending");
        assert!(value.get("processedAt").is_none());
    }

    #[test]
    fn unknown_action_fails_to_parse() {
        let raw = serde_json::json!({
            "id": "cmd-2",
            "serverId": "srv1",
            "action": "delete",
            "requestedBy": "u1",
            "requestedByEmail": "u1@example.com",
            "requestedAt": 0,
            "status": "pending"
        });
        assert!(serde_json::from_value::<CommandRecord>(raw).is_err());
        assert!("delete".parse::<CommandAction>().is_err());
    }

    #[test]
    fn command_status_transitions_only_move_forward() {
        use CommandStatus::*;
        assert!(CommandStatus::can_transition(Pending, Processing));
        assert!(CommandStatus::can_transition(Processing, Completed));
        assert!(CommandStatus::can_transition(Processing, Failed));
        // No bypass, no backwards edges.
        assert!(!CommandStatus::can_transition(Pending, Completed));
        assert!(!CommandStatus::can_transition(Completed, Failed));
        assert!(!CommandStatus::can_transition(Processing, Pending));
        assert!(!CommandStatus::can_transition(Failed, Pending));
    }

    #[test]
    fn server_state_machine_rejects_illegal_edges() {
        use ServerState::*;
        assert!(ServerState::can_transition(Stopped, Starting));
        assert!(ServerState::can_transition(Starting, Running));
        assert!(ServerState::can_transition(Running, Stopping));
        assert!(ServerState::can_transition(Stopping, Stopped));
        assert!(ServerState::can_transition(Running, Error));
        assert!(ServerState::can_transition(Error, Starting));
        assert!(!ServerState::can_transition(Stopped, Stopping));
        assert!(!ServerState::can_transition(Stopped, Running));
        assert!(!ServerState::can_transition(Stopping, Running));
    }

    #[test]
    fn stale_heartbeat_reads_as_offline() {
        let now = 1_700_000_000_000;
        let presence = PresenceRecord {
            online: true,
            last_heartbeat: now - (PRESENCE_STALE_AFTER_MS + 1_000),
            version: "0.1.0".into(),
            hostname: "host-a".into(),
        };
        // 91s old: offline even though the stored flag says online.
        assert!(!presence.is_online(now));

        let fresh = PresenceRecord {
            last_heartbeat: now - 10_000,
            ..presence
        };
        assert!(fresh.is_online(now));
    }

    #[test]
    fn expiry_window_is_five_minutes() {
        let now = epoch_millis();
        let mut record = CommandRecord {
            id: "cmd-3".into(),
            server_id: "srv1".into(),
            action: CommandAction::Stop,
            requested_by: "u1".into(),
            requested_by_email: "u1@example.com".into(),
            requested_at: now - COMMAND_FRESHNESS_WINDOW_MS - 1,
            status: CommandStatus::Pending,
            processed_at: None,
            result: None,
            error: None,
        };
        assert!(record.is_expired(now));
        record.requested_at = now - 1_000;
        assert!(!record.is_expired(now));
        // A client clock slightly ahead of ours is not "expired".
        record.requested_at = now + 5_000;
        assert!(!record.is_expired(now));
    }
}
