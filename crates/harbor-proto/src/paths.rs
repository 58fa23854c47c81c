//! Path addressing for the shared store. Every record lives under a
//! two-segment document path; `servers/{id}/status` addresses the status
//! field of the server document.

pub const COMMANDS: &str = "commands";
pub const SERVERS: &str = "servers";

/// Singleton presence document.
pub const PRESENCE: &str = "agent/status";

pub fn command(command_id: &str) -> String {
    format!("{}/{}", COMMANDS, command_id)
}

pub fn server(server_id: &str) -> String {
    format!("{}/{}", SERVERS, server_id)
}

pub fn server_status(server_id: &str) -> String {
    format!("{}/{}/status", SERVERS, server_id)
}
