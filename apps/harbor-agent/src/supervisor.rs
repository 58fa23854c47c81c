//! Process supervision: the exclusive map from server id to live child
//! handle. All start/stop/restart ordering for one server funnels through
//! its per-server lock; the shared store never grants execution authority,
//! only the local config does.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use harbor_proto::ServerState;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::LaunchConfig;

/// A process that exits within this window counts as a failed start.
const STARTUP_GRACE: Duration = Duration::from_secs(1);

/// Settle pause between confirmed termination and relaunch, so ports and
/// file locks have a moment to release.
const RESTART_SETTLE: Duration = Duration::from_millis(500);

/// How long to wait for SIGKILL to take effect before giving up.
const FORCE_KILL_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("unknown server: {0}; it must be configured in the agent config")]
    UnknownServer(String),
    #[error("server is already running (pid {pid})")]
    AlreadyRunning { pid: u32 },
    #[error("server is not running")]
    NotRunning,
    #[error("executable not found: {0}")]
    MissingExecutable(String),
    #[error("working directory not found: {0}")]
    MissingWorkingDirectory(String),
    #[error("failed to spawn process: {0}")]
    Spawn(String),
    #[error("server exited immediately: {0}")]
    ExitedImmediately(String),
    #[error("process {pid} survived forced termination")]
    KillFailed { pid: u32 },
}

impl SupervisorError {
    /// True for failures that say something went wrong with the process
    /// itself, as opposed to the request being inapplicable (already
    /// running, not running). Process faults drive the resource status to
    /// `error`.
    pub fn is_process_fault(&self) -> bool {
        !matches!(
            self,
            SupervisorError::AlreadyRunning { .. }
                | SupervisorError::NotRunning
                | SupervisorError::UnknownServer(_)
        )
    }
}

/// Snapshot of one supervised server, derived from the live handle. Never
/// contradicts an observed exit: the exit hook updates the entry before
/// any waiter is woken.
#[derive(Debug, Clone)]
pub struct ProcessStatus {
    pub state: ServerState,
    pub pid: Option<u32>,
    pub uptime: Option<Duration>,
    pub message: String,
}

struct RunningServer {
    pid: u32,
    state: ServerState,
    started_at: Instant,
    stdin: Option<ChildStdin>,
    exit_rx: watch::Receiver<bool>,
}

impl RunningServer {
    fn exited(&self) -> bool {
        *self.exit_rx.borrow()
    }

    fn transition(&mut self, to: ServerState) {
        if ServerState::can_transition(self.state, to) {
            self.state = to;
        } else {
            // Should be unreachable; the per-server lock serializes every
            // writer. Refusing the write keeps the map self-consistent.
            warn!(
                target: "harbor_agent::supervisor",
                from = self.state.as_str(),
                to = to.as_str(),
                "refusing illegal state transition"
            );
        }
    }
}

pub struct ProcessSupervisor {
    configs: HashMap<String, LaunchConfig>,
    running: Arc<parking_lot::Mutex<HashMap<String, RunningServer>>>,
    locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProcessSupervisor {
    pub fn new(configs: HashMap<String, LaunchConfig>) -> Self {
        info!(
            target: "harbor_agent::supervisor",
            servers = configs.len(),
            "supervisor initialized"
        );
        Self {
            configs,
            running: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn is_configured(&self, server_id: &str) -> bool {
        self.configs.contains_key(server_id)
    }

    pub fn server_ids(&self) -> Vec<String> {
        self.configs.keys().cloned().collect()
    }

    fn config_for(&self, server_id: &str) -> Result<&LaunchConfig, SupervisorError> {
        self.configs
            .get(server_id)
            .ok_or_else(|| SupervisorError::UnknownServer(server_id.to_string()))
    }

    /// Per-server mutex: the serialization point for all lifecycle
    /// operations against one server id.
    fn lock_for(&self, server_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(server_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Spawn the configured executable and return its pid once it has
    /// survived the startup grace window.
    pub async fn start(&self, server_id: &str) -> Result<u32, SupervisorError> {
        let config = self.config_for(server_id)?.clone();
        let lock = self.lock_for(server_id);
        let _guard = lock.lock().await;

        {
            let mut running = self.running.lock();
            if let Some(entry) = running.get(server_id) {
                if !entry.exited() {
                    return Err(SupervisorError::AlreadyRunning { pid: entry.pid });
                }
                // Stale entry from a process that died; clear and relaunch.
                running.remove(server_id);
            }
        }

        if !config.executable_path.exists() {
            return Err(SupervisorError::MissingExecutable(
                config.executable_path.display().to_string(),
            ));
        }
        let working_dir = config.working_dir();
        if !Path::new(&working_dir).exists() {
            return Err(SupervisorError::MissingWorkingDirectory(
                working_dir.display().to_string(),
            ));
        }

        info!(
            target: "harbor_agent::supervisor",
            server = %server_id,
            executable = %config.executable_path.display(),
            "starting server"
        );

        // Arguments stay a discrete list; nothing is ever joined into a
        // shell invocation.
        let mut command = Command::new(&config.executable_path);
        command
            .args(&config.arguments)
            .current_dir(&working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|err| SupervisorError::Spawn(err.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| SupervisorError::Spawn("process exited before pid capture".into()))?;
        let stdin = child.stdin.take();
        let mut stderr = child.stderr.take();

        let (exit_tx, exit_rx) = watch::channel(false);
        {
            let mut running = self.running.lock();
            running.insert(
                server_id.to_string(),
                RunningServer {
                    pid,
                    state: ServerState::Starting,
                    started_at: Instant::now(),
                    stdin,
                    exit_rx,
                },
            );
        }

        // A process that dies inside the grace window is a start failure,
        // reported with whatever it wrote to stderr.
        if let Ok(wait_result) = tokio::time::timeout(STARTUP_GRACE, child.wait()).await {
            self.running.lock().remove(server_id);
            let status = wait_result.map_err(|err| SupervisorError::Spawn(err.to_string()))?;
            let mut detail = String::new();
            if let Some(stderr) = stderr.as_mut() {
                let _ = stderr.read_to_string(&mut detail).await;
            }
            let detail = detail.trim();
            let reason = if detail.is_empty() {
                status.to_string()
            } else {
                detail.to_string()
            };
            return Err(SupervisorError::ExitedImmediately(reason));
        }

        {
            let mut running = self.running.lock();
            if let Some(entry) = running.get_mut(server_id) {
                entry.transition(ServerState::Running);
            }
        }

        // Exit hook: the task owning the child observes its death and
        // updates the map before waking any waiter.
        let running = Arc::clone(&self.running);
        let server = server_id.to_string();
        tokio::spawn(async move {
            let status = child.wait().await;
            {
                let mut running = running.lock();
                if let Some(entry) = running.get_mut(&server) {
                    if entry.pid == pid {
                        match entry.state {
                            ServerState::Stopping => entry.transition(ServerState::Stopped),
                            _ => {
                                warn!(
                                    target: "harbor_agent::supervisor",
                                    server = %server,
                                    pid,
                                    status = ?status.as_ref().ok(),
                                    "server process exited unexpectedly"
                                );
                                entry.transition(ServerState::Error);
                            }
                        }
                    }
                }
            }
            let _ = exit_tx.send(true);
        });

        info!(
            target: "harbor_agent::supervisor",
            server = %server_id,
            pid,
            "server started"
        );
        Ok(pid)
    }

    /// Graceful-then-forceful stop. Writes the configured stop command to
    /// the server's stdin when there is one, otherwise signals the process
    /// group; arms SIGKILL after the configured stop timeout.
    pub async fn stop(&self, server_id: &str) -> Result<String, SupervisorError> {
        let config = self.config_for(server_id)?.clone();
        let lock = self.lock_for(server_id);
        let _guard = lock.lock().await;

        let (pid, mut exit_rx, stdin) = {
            let mut running = self.running.lock();
            let Some(entry) = running.get_mut(server_id) else {
                return Err(SupervisorError::NotRunning);
            };
            if entry.exited() {
                running.remove(server_id);
                return Err(SupervisorError::NotRunning);
            }
            entry.transition(ServerState::Stopping);
            (entry.pid, entry.exit_rx.clone(), entry.stdin.take())
        };

        info!(
            target: "harbor_agent::supervisor",
            server = %server_id,
            pid,
            "stopping server"
        );

        let mut graceful_sent = false;
        if let (Some(stop_command), Some(mut stdin)) = (config.stop_command.as_deref(), stdin) {
            match write_line(&mut stdin, stop_command).await {
                Ok(()) => {
                    debug!(
                        target: "harbor_agent::supervisor",
                        server = %server_id,
                        "sent stop command"
                    );
                    graceful_sent = true;
                }
                Err(err) => {
                    warn!(
                        target: "harbor_agent::supervisor",
                        server = %server_id,
                        error = %err,
                        "could not send stop command; falling back to SIGTERM"
                    );
                }
            }
        }
        if !graceful_sent {
            signal_group(pid, libc::SIGTERM);
        }

        let stop_timeout = Duration::from_secs(config.stop_timeout_secs);
        if wait_for_exit(&mut exit_rx, stop_timeout).await {
            self.running.lock().remove(server_id);
            info!(
                target: "harbor_agent::supervisor",
                server = %server_id,
                "server stopped gracefully"
            );
            return Ok("server stopped gracefully".to_string());
        }

        warn!(
            target: "harbor_agent::supervisor",
            server = %server_id,
            pid,
            "server did not stop within {}s; force killing",
            config.stop_timeout_secs
        );
        signal_group(pid, libc::SIGKILL);
        let killed = wait_for_exit(&mut exit_rx, FORCE_KILL_WAIT).await;
        self.running.lock().remove(server_id);
        if killed {
            Ok("server force stopped after timeout".to_string())
        } else {
            Err(SupervisorError::KillFailed { pid })
        }
    }

    /// Stop-then-start, strictly ordered: `stop` only returns after the
    /// exit hook has confirmed termination, so two live handles for one id
    /// cannot exist.
    pub async fn restart(&self, server_id: &str) -> Result<u32, SupervisorError> {
        info!(
            target: "harbor_agent::supervisor",
            server = %server_id,
            "restarting server"
        );
        match self.stop(server_id).await {
            Ok(_) | Err(SupervisorError::NotRunning) => {}
            Err(err) => return Err(err),
        }
        tokio::time::sleep(RESTART_SETTLE).await;
        self.start(server_id).await
    }

    /// Current state derived from the live handle and recorded start time.
    pub fn status(&self, server_id: &str) -> ProcessStatus {
        let running = self.running.lock();
        match running.get(server_id) {
            None => ProcessStatus {
                state: ServerState::Stopped,
                pid: None,
                uptime: None,
                message: "server is not running".to_string(),
            },
            Some(entry) => snapshot(entry),
        }
    }

    /// Status sweep across all tracked servers, pruning entries whose
    /// process has exited. Feeds the periodic status sync.
    pub fn sync_all(&self) -> Vec<(String, ProcessStatus)> {
        let mut running = self.running.lock();
        let mut results = Vec::new();
        let mut dead = Vec::new();
        for (server_id, entry) in running.iter() {
            results.push((server_id.clone(), snapshot(entry)));
            if entry.exited() {
                dead.push(server_id.clone());
            }
        }
        for server_id in dead {
            running.remove(&server_id);
        }
        results
    }
}

fn snapshot(entry: &RunningServer) -> ProcessStatus {
    if entry.exited() {
        let state = entry.state;
        let message = match state {
            ServerState::Error => "server process terminated unexpectedly".to_string(),
            _ => "server is not running".to_string(),
        };
        ProcessStatus {
            state,
            pid: None,
            uptime: None,
            message,
        }
    } else {
        let uptime = entry.started_at.elapsed();
        ProcessStatus {
            state: entry.state,
            pid: Some(entry.pid),
            uptime: Some(uptime),
            message: format!("running for {}s", uptime.as_secs()),
        }
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(format!("{line}\n").as_bytes()).await?;
    stdin.flush().await
}

/// Wait for the exit hook to confirm termination, bounded by `timeout`.
async fn wait_for_exit(exit_rx: &mut watch::Receiver<bool>, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, async {
        loop {
            if *exit_rx.borrow_and_update() {
                return true;
            }
            if exit_rx.changed().await.is_err() {
                return *exit_rx.borrow();
            }
        }
    })
    .await
    .unwrap_or(false)
}

/// Signal the server's whole process group so children go down with it.
#[cfg(unix)]
fn signal_group(pid: u32, signal: i32) {
    let result = unsafe { libc::killpg(pid as i32, signal) };
    if result != 0 {
        warn!(
            target: "harbor_agent::supervisor",
            pid,
            signal,
            error = %std::io::Error::last_os_error(),
            "failed to signal process group"
        );
    }
}

#[cfg(not(unix))]
fn signal_group(pid: u32, _signal: i32) {
    warn!(
        target: "harbor_agent::supervisor",
        pid,
        "process-group signalling is not supported on this platform"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch(executable: &str, args: &[&str]) -> LaunchConfig {
        LaunchConfig {
            executable_path: executable.into(),
            working_directory: Some("/tmp".into()),
            arguments: args.iter().map(|s| s.to_string()).collect(),
            stop_command: None,
            stop_timeout_secs: 5,
        }
    }

    fn supervisor_with(entries: Vec<(&str, LaunchConfig)>) -> ProcessSupervisor {
        ProcessSupervisor::new(
            entries
                .into_iter()
                .map(|(id, config)| (id.to_string(), config))
                .collect(),
        )
    }

    #[tokio::test]
    async fn start_status_stop_round_trip() {
        let supervisor = supervisor_with(vec![("srv1", launch("/bin/sleep", &["30"]))]);

        let pid = supervisor.start("srv1").await.unwrap();
        let status = supervisor.status("srv1");
        assert_eq!(status.state, ServerState::Running);
        assert_eq!(status.pid, Some(pid));
        assert!(status.uptime.is_some());

        let message = supervisor.stop("srv1").await.unwrap();
        assert!(message.contains("gracefully"), "got: {message}");
        assert_eq!(supervisor.status("srv1").state, ServerState::Stopped);
    }

    #[tokio::test]
    async fn second_start_reports_already_running() {
        let supervisor = supervisor_with(vec![("srv1", launch("/bin/sleep", &["30"]))]);
        let pid = supervisor.start("srv1").await.unwrap();

        let err = supervisor.start("srv1").await.unwrap_err();
        match err {
            SupervisorError::AlreadyRunning { pid: reported } => assert_eq!(reported, pid),
            other => panic!("unexpected error: {other}"),
        }

        supervisor.stop("srv1").await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_live_process_reports_not_running() {
        let supervisor = supervisor_with(vec![("srv1", launch("/bin/sleep", &["30"]))]);
        assert!(matches!(
            supervisor.stop("srv1").await,
            Err(SupervisorError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn unconfigured_server_is_refused() {
        let supervisor = supervisor_with(vec![]);
        assert!(matches!(
            supervisor.start("ghost").await,
            Err(SupervisorError::UnknownServer(_))
        ));
    }

    #[tokio::test]
    async fn immediate_exit_is_a_start_failure_with_stderr() {
        let supervisor = supervisor_with(vec![(
            "srv1",
            launch("/bin/sh", &["-c", "echo boom >&2; exit 3"]),
        )]);
        let err = supervisor.start("srv1").await.unwrap_err();
        match err {
            SupervisorError::ExitedImmediately(reason) => {
                assert!(reason.contains("boom"), "got: {reason}")
            }
            other => panic!("unexpected error: {other}"),
        }
        // No handle left behind.
        assert_eq!(supervisor.status("srv1").state, ServerState::Stopped);
    }

    #[tokio::test]
    async fn stop_command_drives_a_graceful_exit() {
        let mut config = launch("/bin/sh", &["-c", "read line; exit 0"]);
        config.stop_command = Some("quit".into());
        let supervisor = supervisor_with(vec![("srv1", config)]);

        supervisor.start("srv1").await.unwrap();
        let message = supervisor.stop("srv1").await.unwrap();
        assert!(message.contains("gracefully"), "got: {message}");
    }

    #[tokio::test]
    async fn stubborn_process_is_force_killed_after_timeout() {
        let mut config = launch(
            "/bin/sh",
            &["-c", "trap '' TERM; while true; do sleep 1; done"],
        );
        config.stop_timeout_secs = 1;
        let supervisor = supervisor_with(vec![("srv1", config)]);

        supervisor.start("srv1").await.unwrap();
        let message = supervisor.stop("srv1").await.unwrap();
        assert!(message.contains("force stopped"), "got: {message}");
        assert_eq!(supervisor.status("srv1").state, ServerState::Stopped);
    }

    #[tokio::test]
    async fn restart_confirms_termination_before_relaunch() {
        let supervisor = supervisor_with(vec![("srv1", launch("/bin/sleep", &["30"]))]);
        let first = supervisor.start("srv1").await.unwrap();
        let second = supervisor.restart("srv1").await.unwrap();
        assert_ne!(first, second);
        assert_eq!(supervisor.status("srv1").state, ServerState::Running);
        supervisor.stop("srv1").await.unwrap();
    }

    #[tokio::test]
    async fn restart_from_stopped_is_just_a_start() {
        let supervisor = supervisor_with(vec![("srv1", launch("/bin/sleep", &["30"]))]);
        let pid = supervisor.restart("srv1").await.unwrap();
        assert!(pid > 0);
        supervisor.stop("srv1").await.unwrap();
    }

    #[tokio::test]
    async fn unexpected_death_surfaces_as_error_state() {
        let supervisor = supervisor_with(vec![(
            "srv1",
            launch("/bin/sh", &["-c", "sleep 2; exit 1"]),
        )]);
        supervisor.start("srv1").await.unwrap();
        assert_eq!(supervisor.status("srv1").state, ServerState::Running);

        // Wait out the process's own lifetime, then the exit hook must
        // have flipped the entry to error.
        let mut state = ServerState::Running;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            state = supervisor.status("srv1").state;
            if state == ServerState::Error {
                break;
            }
        }
        assert_eq!(state, ServerState::Error);

        // The sweep reports the death once, then prunes the entry.
        let swept = supervisor.sync_all();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].1.state, ServerState::Error);
        assert!(supervisor.sync_all().is_empty());
        assert_eq!(supervisor.status("srv1").state, ServerState::Stopped);

        // Error is terminal until retried: a fresh start succeeds.
        let supervisor2 = supervisor_with(vec![("srv1", launch("/bin/sleep", &["30"]))]);
        supervisor2.start("srv1").await.unwrap();
        supervisor2.stop("srv1").await.unwrap();
    }
}
