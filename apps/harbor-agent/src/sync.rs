//! Periodic reconciliation: publishes the supervisor's view of every
//! tracked server, re-offers stored pending commands to the executor (the
//! expiry sweeper), and prunes the executor's bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::executor::CommandExecutor;
use crate::status::StatusPublisher;
use crate::supervisor::ProcessSupervisor;

pub struct StatusSyncLoop {
    supervisor: Arc<ProcessSupervisor>,
    status: Arc<StatusPublisher>,
    executor: Arc<CommandExecutor>,
    interval: Duration,
}

impl StatusSyncLoop {
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        status: Arc<StatusPublisher>,
        executor: Arc<CommandExecutor>,
        interval: Duration,
    ) -> Self {
        Self {
            supervisor,
            status,
            executor,
            interval,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            target: "harbor_agent::sync",
            interval_secs = self.interval.as_secs(),
            "status sync started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
            self.tick().await;
        }
    }

    pub async fn tick(&self) {
        for (server_id, snapshot) in self.supervisor.sync_all() {
            if let Err(err) = self
                .status
                .publish(&server_id, snapshot.state, &snapshot.message, snapshot.pid)
                .await
            {
                warn!(
                    target: "harbor_agent::sync",
                    server = %server_id,
                    error = %err,
                    "status sync write failed"
                );
            }
        }
        self.executor.sweep_pending().await;
        self.executor.prune();
    }
}
