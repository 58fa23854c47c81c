//! Status publication with the agent's monotonic-timestamp discipline.
//! The shared store is last-writer-wins and does not order writes itself;
//! this publisher guarantees the agent never stamps a status older than
//! one it already wrote.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use harbor_proto::{epoch_millis, paths, ServerState, StatusRecord};
use sync_store::{StoreBackend, StoreError};
use tracing::{info, warn};

pub struct StatusPublisher {
    store: Arc<dyn StoreBackend>,
    last_updated: parking_lot::Mutex<HashMap<String, i64>>,
}

impl StatusPublisher {
    pub fn new(store: Arc<dyn StoreBackend>) -> Self {
        Self {
            store,
            last_updated: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub async fn publish(
        &self,
        server_id: &str,
        state: ServerState,
        message: &str,
        pid: Option<u32>,
    ) -> Result<(), StoreError> {
        let now = epoch_millis();
        {
            let mut last = self.last_updated.lock();
            let entry = last.entry(server_id.to_string()).or_insert(i64::MIN);
            if now < *entry {
                warn!(
                    target: "harbor_agent::status",
                    server = %server_id,
                    stamped = now,
                    newest = *entry,
                    "ignoring out-of-order status write"
                );
                return Ok(());
            }
            *entry = now;
        }

        let record = StatusRecord {
            state,
            last_updated: now,
            message: message.to_string(),
            pid,
        };
        let value = serde_json::to_value(&record)
            .map_err(|err| StoreError::Transport(err.to_string()))?;
        let path = paths::server_status(server_id);

        // Transient store errors get a short retry ladder before the write
        // is surfaced.
        let mut delay = Duration::from_secs(1);
        let mut attempt = 0u32;
        loop {
            match self.store.put(&path, value.clone()).await {
                Ok(()) => {
                    info!(
                        target: "harbor_agent::status",
                        server = %server_id,
                        state = state.as_str(),
                        "server status published"
                    );
                    return Ok(());
                }
                Err(err) if err.is_transient() && attempt < 2 => {
                    attempt += 1;
                    warn!(
                        target: "harbor_agent::status",
                        server = %server_id,
                        error = %err,
                        attempt,
                        "status write failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_store::MemoryStore;

    #[tokio::test]
    async fn publishes_status_under_the_server_document() {
        let store = Arc::new(MemoryStore::new());
        let publisher = StatusPublisher::new(store.clone());
        publisher
            .publish("srv1", ServerState::Running, "running for 3s", Some(42))
            .await
            .unwrap();

        let status = store
            .get("servers/srv1/status")
            .await
            .unwrap()
            .expect("status stored");
        assert_eq!(status["state"], "running");
        assert_eq!(status["pid"], 42);
        assert!(status["lastUpdated"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn timestamps_never_go_backwards() {
        let store = Arc::new(MemoryStore::new());
        let publisher = StatusPublisher::new(store.clone());

        publisher
            .publish("srv1", ServerState::Running, "", Some(1))
            .await
            .unwrap();
        // Pretend the clock has already advanced far into the future, then
        // write again: the older wall-clock stamp must be dropped.
        {
            let mut last = publisher.last_updated.lock();
            *last.get_mut("srv1").unwrap() = i64::MAX;
        }
        publisher
            .publish("srv1", ServerState::Stopped, "", None)
            .await
            .unwrap();

        let status = store.get("servers/srv1/status").await.unwrap().unwrap();
        assert_eq!(status["state"], "running");
    }
}
