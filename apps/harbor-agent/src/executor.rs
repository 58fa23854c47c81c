//! Command execution: the subscription worker that discovers pending
//! command records, claims them, validates, delegates to the process
//! supervisor, and writes the terminal outcome. Failures are contained
//! per command; nothing a single record does can take the executor down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use harbor_proto::{
    epoch_millis, paths, CommandAction, CommandRecord, CommandStatus, ServerState,
};
use serde_json::{json, Value};
use sync_store::StoreBackend;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::status::StatusPublisher;
use crate::supervisor::{ProcessSupervisor, SupervisorError};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub freshness_window_ms: i64,
    pub rate_limit_per_minute: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            freshness_window_ms: harbor_proto::COMMAND_FRESHNESS_WINDOW_MS,
            rate_limit_per_minute: 10,
        }
    }
}

pub struct CommandExecutor {
    store: Arc<dyn StoreBackend>,
    supervisor: Arc<ProcessSupervisor>,
    status: Arc<StatusPublisher>,
    settings: ExecutorSettings,
    /// Command ids this instance has handled, for at-least-once delivery.
    /// Bounded by [`Self::prune`], which keeps at least the freshness
    /// window covered.
    processed: parking_lot::Mutex<HashMap<String, i64>>,
    /// Per-server timestamps of recent commands for the spam brake.
    recent: parking_lot::Mutex<HashMap<String, Vec<i64>>>,
}

impl CommandExecutor {
    pub fn new(
        store: Arc<dyn StoreBackend>,
        supervisor: Arc<ProcessSupervisor>,
        status: Arc<StatusPublisher>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            store,
            supervisor,
            status,
            settings,
            processed: parking_lot::Mutex::new(HashMap::new()),
            recent: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Subscription loop. The store replays current records on every
    /// subscribe, so a reconnect after an outage picks up whatever was
    /// missed; redelivered records are screened out by the processed set
    /// and the claim step.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.store.subscribe(paths::COMMANDS).await {
                Ok(mut subscription) => {
                    info!(target: "harbor_agent::executor", "listening for commands");
                    backoff = INITIAL_BACKOFF;
                    loop {
                        tokio::select! {
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    return;
                                }
                            }
                            event = subscription.next() => match event {
                                Ok(event) => {
                                    // Only pending records are actionable;
                                    // everything else on the channel is an
                                    // outcome echo.
                                    if event.value.get("status").and_then(Value::as_str)
                                        == Some(CommandStatus::Pending.as_str())
                                    {
                                        let executor = Arc::clone(&self);
                                        tokio::spawn(async move {
                                            executor.process(&event.path, event.value).await;
                                        });
                                    }
                                }
                                Err(lost) => {
                                    warn!(
                                        target: "harbor_agent::executor",
                                        reason = %lost,
                                        "command subscription lost"
                                    );
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        target: "harbor_agent::executor",
                        error = %err,
                        "command subscription failed"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Handle one command record. Safe to call more than once per id:
    /// at most one supervisor invocation ever happens.
    pub async fn process(&self, path: &str, value: Value) {
        let Some(command_id) = path.strip_prefix("commands/") else {
            return;
        };
        let command_id = command_id.to_string();

        {
            let mut processed = self.processed.lock();
            if processed.contains_key(&command_id) {
                debug!(
                    target: "harbor_agent::executor",
                    command = %command_id,
                    "skipping already processed command"
                );
                return;
            }
            processed.insert(command_id.clone(), epoch_millis());
        }

        // Claim pending→processing. Losing the claim means another
        // instance (or an earlier life of this one) owns the record.
        match self
            .store
            .claim(
                path,
                "status",
                CommandStatus::Pending.as_str(),
                json!({
                    "status": CommandStatus::Processing.as_str(),
                    "processedAt": epoch_millis(),
                }),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    target: "harbor_agent::executor",
                    command = %command_id,
                    "command already claimed"
                );
                return;
            }
            Err(err) => {
                warn!(
                    target: "harbor_agent::executor",
                    command = %command_id,
                    error = %err,
                    "claim failed; leaving command for redelivery"
                );
                self.processed.lock().remove(&command_id);
                return;
            }
        }

        let record: CommandRecord = match serde_json::from_value(value) {
            Ok(record) => record,
            Err(err) => {
                let reason = format!("malformed command record: {err}");
                warn!(
                    target: "harbor_agent::audit",
                    command = %command_id,
                    outcome = "rejected",
                    reason = %reason,
                    "command rejected"
                );
                self.write_failed(path, &reason).await;
                return;
            }
        };

        if let Err(reason) = self.validate(&record) {
            warn!(
                target: "harbor_agent::audit",
                command = %record.id,
                server = %record.server_id,
                action = record.action.as_str(),
                requested_by = %record.requested_by,
                outcome = "rejected",
                reason = %reason,
                "command rejected"
            );
            self.write_failed(path, &reason).await;
            return;
        }

        info!(
            target: "harbor_agent::executor",
            command = %record.id,
            server = %record.server_id,
            action = record.action.as_str(),
            "executing command"
        );
        let outcome = self.execute(&record).await;

        match outcome {
            Ok((message, state, pid)) => {
                self.write_completed(path, &message).await;
                if let Err(err) = self
                    .status
                    .publish(&record.server_id, state, &message, pid)
                    .await
                {
                    warn!(
                        target: "harbor_agent::executor",
                        server = %record.server_id,
                        error = %err,
                        "failed to publish server status"
                    );
                }
                info!(
                    target: "harbor_agent::audit",
                    command = %record.id,
                    server = %record.server_id,
                    action = record.action.as_str(),
                    requested_by = %record.requested_by,
                    outcome = "completed",
                    "command executed"
                );
            }
            Err(failure) => {
                let reason = failure.reason;
                self.write_failed(path, &reason).await;
                let status_result = if failure.process_fault {
                    self.status
                        .publish(
                            &record.server_id,
                            ServerState::Error,
                            &format!("command failed: {reason}"),
                            None,
                        )
                        .await
                } else {
                    // The process itself is fine; republish its actual
                    // state so viewers are not misled.
                    let current = self.supervisor.status(&record.server_id);
                    self.status
                        .publish(
                            &record.server_id,
                            current.state,
                            &format!("command failed: {reason}"),
                            current.pid,
                        )
                        .await
                };
                if let Err(err) = status_result {
                    warn!(
                        target: "harbor_agent::executor",
                        server = %record.server_id,
                        error = %err,
                        "failed to publish server status"
                    );
                }
                warn!(
                    target: "harbor_agent::audit",
                    command = %record.id,
                    server = %record.server_id,
                    action = record.action.as_str(),
                    requested_by = %record.requested_by,
                    outcome = "failed",
                    reason = %reason,
                    "command failed"
                );
            }
        }
    }

    fn validate(&self, record: &CommandRecord) -> Result<(), String> {
        // The store is coordination, not authority: only servers in the
        // agent's own config are operable.
        if !self.supervisor.is_configured(&record.server_id) {
            return Err(format!(
                "unknown server: {}; it must be configured in the agent config",
                record.server_id
            ));
        }

        let age_ms = record.age_ms(epoch_millis());
        if age_ms > self.settings.freshness_window_ms {
            return Err(format!(
                "command expired (age: {}s, max: {}s)",
                age_ms / 1_000,
                self.settings.freshness_window_ms / 1_000
            ));
        }

        if !self.admit_rate(&record.server_id) {
            return Err("rate limit exceeded; wait before sending more commands".to_string());
        }

        Ok(())
    }

    /// Sliding one-minute window per server.
    fn admit_rate(&self, server_id: &str) -> bool {
        let now = epoch_millis();
        let mut recent = self.recent.lock();
        let window = recent.entry(server_id.to_string()).or_default();
        window.retain(|stamp| now - *stamp < 60_000);
        if window.len() >= self.settings.rate_limit_per_minute {
            return false;
        }
        window.push(now);
        true
    }

    async fn execute(&self, record: &CommandRecord) -> Result<(String, ServerState, Option<u32>), ExecutionFailure> {
        let supervisor = Arc::clone(&self.supervisor);
        let server_id = record.server_id.clone();
        let action = record.action;

        // Run the action on its own task so a panic inside it surfaces as
        // a failed command instead of a dead executor.
        let joined = tokio::spawn(async move {
            match action {
                CommandAction::Start => supervisor
                    .start(&server_id)
                    .await
                    .map(|pid| (format!("server started (pid {pid})"), ServerState::Running, Some(pid))),
                CommandAction::Stop => supervisor
                    .stop(&server_id)
                    .await
                    .map(|message| (message, ServerState::Stopped, None)),
                CommandAction::Restart => supervisor
                    .restart(&server_id)
                    .await
                    .map(|pid| (format!("server restarted (pid {pid})"), ServerState::Running, Some(pid))),
            }
        })
        .await;

        match joined {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(err)) => Err(ExecutionFailure {
                process_fault: err.is_process_fault(),
                reason: err.to_string(),
            }),
            Err(join_err) => Err(ExecutionFailure {
                process_fault: true,
                reason: format!("internal error: {join_err}"),
            }),
        }
    }

    async fn write_completed(&self, path: &str, result: &str) {
        let update = json!({
            "status": CommandStatus::Completed.as_str(),
            "result": result,
            "processedAt": epoch_millis(),
        });
        self.merge_outcome(path, update).await;
    }

    async fn write_failed(&self, path: &str, reason: &str) {
        let update = json!({
            "status": CommandStatus::Failed.as_str(),
            "error": reason,
            "processedAt": epoch_millis(),
        });
        self.merge_outcome(path, update).await;
    }

    /// Append outcome fields, retrying transient store errors with a short
    /// backoff before giving up.
    async fn merge_outcome(&self, path: &str, update: Value) {
        let mut delay = Duration::from_secs(1);
        for attempt in 1..=3u32 {
            match self.store.merge(path, update.clone()).await {
                Ok(()) => return,
                Err(err) if err.is_transient() && attempt < 3 => {
                    warn!(
                        target: "harbor_agent::executor",
                        %path,
                        error = %err,
                        attempt,
                        "outcome write failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(err) => {
                    warn!(
                        target: "harbor_agent::executor",
                        %path,
                        error = %err,
                        "failed to record command outcome"
                    );
                    return;
                }
            }
        }
    }

    /// Offer every stored pending command to the normal pipeline. Fresh
    /// records missed by the subscription get executed; records older than
    /// the freshness window get their expiry failure written, so nothing
    /// stays pending forever just because the agent was down.
    pub async fn sweep_pending(&self) {
        let docs = match self.store.list(paths::COMMANDS).await {
            Ok(docs) => docs,
            Err(err) => {
                warn!(
                    target: "harbor_agent::executor",
                    error = %err,
                    "pending-command sweep failed"
                );
                return;
            }
        };
        for (path, value) in docs {
            if value.get("status").and_then(Value::as_str)
                == Some(CommandStatus::Pending.as_str())
            {
                self.process(&path, value).await;
            }
        }
    }

    /// Drop processed-set and rate-window entries that no longer matter.
    /// Everything inside the freshness window is kept, so redelivery
    /// within it can never re-trigger an action.
    pub fn prune(&self) {
        let cutoff = epoch_millis() - 2 * self.settings.freshness_window_ms;
        self.processed.lock().retain(|_, seen| *seen >= cutoff);
        let minute_ago = epoch_millis() - 60_000;
        let mut recent = self.recent.lock();
        recent.retain(|_, window| {
            window.retain(|stamp| *stamp >= minute_ago);
            !window.is_empty()
        });
    }
}

struct ExecutionFailure {
    process_fault: bool,
    reason: String,
}
