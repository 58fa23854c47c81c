//! Redis-backed store: documents as JSON values in the keyspace, change
//! notification over pub/sub. Mirrors the contract of the production
//! real-time store closely enough that the agent and panel SDK cannot tell
//! the difference.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{
    merge_into, split_path, StoreBackend, StoreError, StoreEvent, Subscription,
};

const EVENT_CAPACITY: usize = 256;
const EVENTS_CHANNEL: &str = "harbor:events";
const LISTENER_RETRY: Duration = Duration::from_secs(2);

/// TTL on claim markers; anything past the command freshness window is
/// dead weight either way.
const CLAIM_TTL_SECONDS: u64 = 300;

fn doc_key(doc_path: &str) -> String {
    format!("harbor:doc:{doc_path}")
}

fn claim_key(doc_path: &str) -> String {
    format!("harbor:claim:{doc_path}")
}

pub struct RedisStore {
    conn: ConnectionManager,
    events: broadcast::Sender<StoreEvent>,
    listener: tokio::task::JoinHandle<()>,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(transport)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(transport)?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let listener = tokio::spawn(run_listener(client, events.clone()));

        Ok(Self {
            conn,
            events,
            listener,
        })
    }

    async fn read_doc(&self, doc_path: &str) -> Result<Option<Value>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(doc_key(doc_path)).await.map_err(transport)?;
        match raw {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|err| StoreError::Transport(format!("corrupt document: {err}"))),
            None => Ok(None),
        }
    }

    async fn write_doc(&self, doc_path: &str, doc: &Value) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let serialized = serde_json::to_string(doc).map_err(encode)?;
        let event = serde_json::to_string(&StoreEvent {
            path: doc_path.to_string(),
            value: doc.clone(),
        })
        .map_err(encode)?;
        // Write and notify in one round trip.
        redis::pipe()
            .cmd("SET")
            .arg(doc_key(doc_path))
            .arg(&serialized)
            .ignore()
            .cmd("PUBLISH")
            .arg(EVENTS_CHANNEL)
            .arg(&event)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn scan_docs(&self, pattern: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut results = Vec::new();
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100u32)
                .query_async(&mut conn)
                .await
                .map_err(transport)?;
            cursor = next_cursor;
            if !keys.is_empty() {
                let values: Vec<Option<String>> = redis::cmd("MGET")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(transport)?;
                for (key, raw) in keys.into_iter().zip(values) {
                    let Some(raw) = raw else { continue };
                    let Ok(value) = serde_json::from_str::<Value>(&raw) else {
                        warn!(target: "sync_store::redis", %key, "skipping corrupt document");
                        continue;
                    };
                    let path = key.trim_start_matches("harbor:doc:").to_string();
                    results.push((path, value));
                }
            }
            if cursor == 0 {
                break;
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(results)
    }
}

impl Drop for RedisStore {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn run_listener(client: Client, events: broadcast::Sender<StoreEvent>) {
    loop {
        match client.get_async_pubsub().await {
            Ok(mut pubsub) => {
                if let Err(err) = pubsub.subscribe(EVENTS_CHANNEL).await {
                    warn!(target: "sync_store::redis", error = %err, "pubsub subscribe failed");
                } else {
                    debug!(target: "sync_store::redis", channel = EVENTS_CHANNEL, "listening for store events");
                    let mut stream = pubsub.on_message();
                    while let Some(msg) = stream.next().await {
                        let Ok(payload) = msg.get_payload::<String>() else {
                            continue;
                        };
                        match serde_json::from_str::<StoreEvent>(&payload) {
                            Ok(event) => {
                                let _ = events.send(event);
                            }
                            Err(err) => {
                                warn!(target: "sync_store::redis", error = %err, "dropping malformed store event");
                            }
                        }
                    }
                }
            }
            Err(err) => {
                warn!(target: "sync_store::redis", error = %err, "pubsub connection failed");
            }
        }
        tokio::time::sleep(LISTENER_RETRY).await;
    }
}

#[async_trait]
impl StoreBackend for RedisStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let (doc_path, field) = split_path(path)?;
        let doc = self.read_doc(&doc_path).await?;
        Ok(match (doc, field) {
            (Some(doc), Some(field)) => doc.get(&field).cloned(),
            (doc, None) => doc,
        })
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>, StoreError> {
        if collection.contains('/') {
            // A full document path: at most one result.
            return Ok(self
                .read_doc(collection)
                .await?
                .map(|doc| (collection.to_string(), doc))
                .into_iter()
                .collect());
        }
        self.scan_docs(&format!("harbor:doc:{collection}/*")).await
    }

    async fn put(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let (doc_path, field) = split_path(path)?;
        let doc = match field {
            None => value,
            Some(field) => {
                let mut doc = self
                    .read_doc(&doc_path)
                    .await?
                    .unwrap_or_else(|| Value::Object(Default::default()));
                merge_into(&mut doc, &serde_json::json!({ field: value }));
                doc
            }
        };
        self.write_doc(&doc_path, &doc).await
    }

    async fn create(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let (doc_path, field) = split_path(path)?;
        if field.is_some() {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        let mut conn = self.conn.clone();
        let serialized = serde_json::to_string(&value).map_err(encode)?;
        let stored: Option<String> = redis::cmd("SET")
            .arg(doc_key(&doc_path))
            .arg(&serialized)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(transport)?;
        if stored.is_none() {
            return Err(StoreError::AlreadyExists(doc_path));
        }
        let event = serde_json::to_string(&StoreEvent {
            path: doc_path.clone(),
            value,
        })
        .map_err(encode)?;
        conn.publish::<_, _, ()>(EVENTS_CHANNEL, event)
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn merge(&self, path: &str, fields: Value) -> Result<(), StoreError> {
        let (doc_path, field) = split_path(path)?;
        if field.is_some() {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        let mut doc = self
            .read_doc(&doc_path)
            .await?
            .unwrap_or_else(|| Value::Object(Default::default()));
        merge_into(&mut doc, &fields);
        self.write_doc(&doc_path, &doc).await
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

        // Serialize claimants on a marker key; the TTL bounds abandoned
        // claims from a crashed instance.
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(claim_key(&doc_path))
            .arg(format!("{field}={expected}"))
            .arg("NX")
            .arg("EX")
            .arg(CLAIM_TTL_SECONDS)
            .query_async(&mut conn)
            .await
            .map_err(transport)?;
        if acquired.is_none() {
            return Ok(false);
        }

        let Some(mut doc) = self.read_doc(&doc_path).await? else {
            let _: () = conn.del(claim_key(&doc_path)).await.map_err(transport)?;
            return Ok(false);
        };
        if doc.get(field).and_then(Value::as_str) != Some(expected) {
            let _: () = conn.del(claim_key(&doc_path)).await.map_err(transport)?;
            return Ok(false);
        }
        merge_into(&mut doc, &update);
        self.write_doc(&doc_path, &doc).await?;
        Ok(true)
    }

    async fn subscribe(&self, prefix: &str) -> Result<Subscription, StoreError> {
        // Subscribe to the event stream before snapshotting so no write can
        // fall between them.
        let rx = self.events.subscribe();
        let snapshot = self
            .list(prefix)
            .await?
            .into_iter()
            .map(|(path, value)| StoreEvent { path, value })
            .collect();
        Ok(Subscription::new(prefix.to_string(), snapshot, rx))
    }
}

fn transport(err: impl std::fmt::Display) -> StoreError {
    StoreError::Transport(err.to_string())
}

fn encode(err: serde_json::Error) -> StoreError {
    StoreError::Transport(format!("encode failed: {err}"))
}
