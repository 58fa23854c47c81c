use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use harbor_agent::config::{AgentConfig, StoreKind};
use harbor_agent::executor::{CommandExecutor, ExecutorSettings};
use harbor_agent::presence::PresenceBeacon;
use harbor_agent::status::StatusPublisher;
use harbor_agent::supervisor::ProcessSupervisor;
use harbor_agent::sync::StatusSyncLoop;
use sync_store::{MemoryStore, StoreBackend};
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "harbor-agent", about = "Privileged executor for Harbor-managed servers")]
struct Cli {
    /// Path to the agent configuration file.
    #[arg(long, env = "HARBOR_AGENT_CONFIG", default_value = "harbor-agent.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = AgentConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    info!(
        servers = config.servers.len(),
        hostname = %config.hostname(),
        "starting harbor agent v{}",
        env!("CARGO_PKG_VERSION")
    );

    let store = connect_store(&config).await?;

    let supervisor = Arc::new(ProcessSupervisor::new(config.servers.clone()));
    let status = Arc::new(StatusPublisher::new(store.clone()));
    let executor = Arc::new(CommandExecutor::new(
        store.clone(),
        supervisor.clone(),
        status.clone(),
        ExecutorSettings {
            freshness_window_ms: (config.agent.command_expiry_secs as i64) * 1_000,
            rate_limit_per_minute: config.agent.rate_limit_per_minute,
        },
    ));
    let beacon = PresenceBeacon::new(
        store.clone(),
        config.hostname(),
        Duration::from_secs(config.agent.heartbeat_interval_secs),
    );
    let sync = StatusSyncLoop::new(
        supervisor,
        status,
        executor.clone(),
        Duration::from_secs(config.agent.status_sync_interval_secs),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = Vec::new();
    {
        let shutdown = shutdown_rx.clone();
        workers.push(tokio::spawn(async move { executor.run(shutdown).await }));
    }
    {
        let shutdown = shutdown_rx.clone();
        workers.push(tokio::spawn(async move { beacon.run(shutdown).await }));
    }
    {
        let shutdown = shutdown_rx;
        workers.push(tokio::spawn(async move { sync.run(shutdown).await }));
    }

    info!("harbor agent is running; press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    // Managed servers are left running on purpose; only the agent's own
    // loops wind down.
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }
    info!("harbor agent stopped");
    Ok(())
}

async fn connect_store(config: &AgentConfig) -> anyhow::Result<Arc<dyn StoreBackend>> {
    match config.store.backend {
        StoreKind::Memory => {
            info!("using in-memory store backend");
            Ok(Arc::new(MemoryStore::new()))
        }
        #[cfg(feature = "redis-backend")]
        StoreKind::Redis => {
            info!(url = %config.store.redis_url, "connecting to redis store backend");
            let store = sync_store::RedisStore::connect(&config.store.redis_url)
                .await
                .context("connecting to redis")?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis-backend"))]
        StoreKind::Redis => {
            anyhow::bail!("this build has no redis support; rebuild with --features redis-backend")
        }
    }
}
