//! Agent configuration: a TOML file naming the servers this host is
//! willing to operate, plus store and timing settings. The server list is
//! the agent's trust boundary — a server record appearing in the shared
//! store grants nothing; only an entry here does.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use harbor_proto::DEFAULT_STOP_TIMEOUT_SECS;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(PathBuf),
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub servers: HashMap<String, LaunchConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSection {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_status_sync_interval")]
    pub status_sync_interval_secs: u64,
    /// Commands older than this are rejected as expired.
    #[serde(default = "default_command_expiry")]
    pub command_expiry_secs: u64,
    /// Commands per server per rolling minute before the spam brake trips.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: usize,
    /// Reported in presence; falls back to $HOSTNAME.
    pub hostname: Option<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            status_sync_interval_secs: default_status_sync_interval(),
            command_expiry_secs: default_command_expiry(),
            rate_limit_per_minute: default_rate_limit(),
            hostname: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreSection {
    #[serde(default)]
    pub backend: StoreKind,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreKind::Memory,
            redis_url: default_redis_url(),
        }
    }
}

/// How to launch and stop one managed server. Arguments stay a discrete
/// list all the way to spawn; nothing here is ever joined into a shell
/// string.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LaunchConfig {
    pub executable_path: PathBuf,
    /// Defaults to the executable's directory.
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Line written to the server's stdin for a graceful stop. Without
    /// one, the process group gets SIGTERM instead.
    pub stop_command: Option<String>,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

impl LaunchConfig {
    pub fn working_dir(&self) -> PathBuf {
        self.working_directory.clone().unwrap_or_else(|| {
            self.executable_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        })
    }
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_status_sync_interval() -> u64 {
    60
}

fn default_command_expiry() -> u64 {
    300
}

fn default_rate_limit() -> usize {
    10
}

fn default_stop_timeout() -> u64 {
    DEFAULT_STOP_TIMEOUT_SECS
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: AgentConfig = toml::from_str(&raw)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides take precedence over the file so a deployment
    /// can repoint the store without editing operator-managed config.
    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("HARBOR_REDIS_URL") {
            self.store.redis_url = url;
        }
        if let Ok(backend) = std::env::var("HARBOR_STORE_BACKEND") {
            match backend.to_ascii_lowercase().as_str() {
                "memory" => self.store.backend = StoreKind::Memory,
                "redis" => self.store.backend = StoreKind::Redis,
                _ => {}
            }
        }
        if let Ok(hostname) = std::env::var("HARBOR_HOSTNAME") {
            self.agent.hostname = Some(hostname);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (server_id, launch) in &self.servers {
            if launch.executable_path.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "server {server_id} has an empty executable_path"
                )));
            }
            if launch.stop_timeout_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "server {server_id} has a zero stop_timeout_secs"
                )));
            }
        }
        if self.agent.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn hostname(&self) -> String {
        self.agent
            .hostname
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "unknown".to_string())
    }
}
