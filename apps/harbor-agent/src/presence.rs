//! Presence heartbeat: a periodic write to the singleton `agent/status`
//! document so every viewer can tell a dead agent from a slow one.
//! Readers apply the 90-second staleness rule; the stored `online` flag on
//! its own proves nothing.

use std::sync::Arc;
use std::time::Duration;

use harbor_proto::{epoch_millis, paths, PresenceRecord};
use sync_store::{StoreBackend, StoreError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct PresenceBeacon {
    store: Arc<dyn StoreBackend>,
    hostname: String,
    interval: Duration,
}

impl PresenceBeacon {
    pub fn new(store: Arc<dyn StoreBackend>, hostname: String, interval: Duration) -> Self {
        Self {
            store,
            hostname,
            interval,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            target: "harbor_agent::presence",
            interval_secs = self.interval.as_secs(),
            "heartbeat started"
        );
        loop {
            if let Err(err) = self.beat(true).await {
                warn!(
                    target: "harbor_agent::presence",
                    error = %err,
                    "heartbeat failed"
                );
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        // Best-effort offline marker; the staleness rule covers us if this
        // write never lands.
        if let Err(err) = self.beat(false).await {
            debug!(
                target: "harbor_agent::presence",
                error = %err,
                "offline marker not written"
            );
        }
    }

    async fn beat(&self, online: bool) -> Result<(), StoreError> {
        let record = PresenceRecord {
            online,
            last_heartbeat: epoch_millis(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: self.hostname.clone(),
        };
        let value = serde_json::to_value(&record)
            .map_err(|err| StoreError::Transport(err.to_string()))?;
        self.store.put(paths::PRESENCE, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_store::MemoryStore;

    #[tokio::test]
    async fn beacon_writes_heartbeats_and_offline_marker() {
        let store = Arc::new(MemoryStore::new());
        let beacon = PresenceBeacon::new(
            store.clone(),
            "host-a".into(),
            Duration::from_millis(50),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { beacon.run(shutdown_rx).await });

        // First heartbeat lands promptly and reads as online.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let doc = store.get(paths::PRESENCE).await.unwrap().unwrap();
        let record: PresenceRecord = serde_json::from_value(doc).unwrap();
        assert!(record.online);
        assert_eq!(record.hostname, "host-a");
        assert!(record.is_online(epoch_millis()));

        // Shutdown flips the stored flag to offline.
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        let doc = store.get(paths::PRESENCE).await.unwrap().unwrap();
        let record: PresenceRecord = serde_json::from_value(doc).unwrap();
        assert!(!record.online);
    }
}
