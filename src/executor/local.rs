use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, RwLock};

use super::backend::ExecutorBackend;
use super::class::{ExecutorClass, Manifest};
use super::handle::{
    ExecutorHandle, ExecutorId, ExitOutcome, LaunchRequest, OrphanExecutor, RuntimeRef,
    WaitOutcome,
};
use crate::config::{LocalBackendConfig, NodeConfig};
use crate::error::{MinerError, Result};

pub const ENV_COORDINATOR_ADDRESS: &str = "COORDINATOR_ADDRESS";
pub const ENV_EXECUTOR_TOKEN: &str = "EXECUTOR_TOKEN";
pub const ENV_EXECUTOR_PORT: &str = "EXECUTOR_PORT";
pub const ENV_EXECUTOR_CLASS: &str = "EXECUTOR_CLASS";
pub const ENV_EXECUTOR_ID: &str = "EXECUTOR_ID";

/// Slack on top of the grace period for SIGKILL delivery and reaping.
const KILL_SETTLE: Duration = Duration::from_secs(2);
/// How often a reclaimed orphan is checked for exit.
const ORPHAN_POLL: Duration = Duration::from_millis(50);

/// One running child as recorded in the state directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ProcessRecord {
    executor_id: ExecutorId,
    pid: u32,
    port: u16,
    executor_class: ExecutorClass,
}

impl From<ProcessRecord> for OrphanExecutor {
    fn from(record: ProcessRecord) -> Self {
        OrphanExecutor {
            runtime: RuntimeRef::Process { pid: record.pid },
            executor_id: Some(record.executor_id),
            executor_class: Some(record.executor_class),
            port: Some(record.port),
        }
    }
}

struct LocalProcess {
    pid: u32,
    kill_tx: mpsc::Sender<()>,
    exit_rx: watch::Receiver<Option<ExitOutcome>>,
}

/// Runs every executor as a child process of the node.
///
/// Development only: there is no isolation, and the manifest is the
/// configured capacity rather than anything measured on the host.
///
/// With a state directory configured, every live child has a record file
/// there until it is released. A node that died without reaping its
/// children finds them through [`ExecutorBackend::inventory`] on restart.
pub struct LocalProcessBackend {
    config: LocalBackendConfig,
    manifest: Manifest,
    public_ip: IpAddr,
    grace: Duration,
    processes: RwLock<HashMap<ExecutorId, LocalProcess>>,
}

impl LocalProcessBackend {
    pub fn new(
        config: LocalBackendConfig,
        manifest: Manifest,
        public_ip: IpAddr,
        grace: Duration,
    ) -> Self {
        Self {
            config,
            manifest,
            public_ip,
            grace,
            processes: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_node_config(config: &NodeConfig) -> Self {
        Self::new(
            config.local.clone(),
            Manifest::from(config.executor_classes.clone()),
            config.public_ip,
            config.kill_grace(),
        )
    }

    /// Number of children whose exit has not been observed yet.
    pub async fn running(&self) -> usize {
        self.processes
            .read()
            .await
            .values()
            .filter(|p| p.exit_rx.borrow().is_none())
            .count()
    }

    fn record_path(&self, id: &ExecutorId) -> Option<PathBuf> {
        self.config
            .state_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", id)))
    }

    async fn write_record(&self, record: &ProcessRecord) -> Result<()> {
        let (Some(dir), Some(path)) = (
            self.config.state_dir.as_ref(),
            self.record_path(&record.executor_id),
        ) else {
            return Ok(());
        };
        let body = serde_json::to_vec(record)
            .map_err(|e| MinerError::Backend(format!("failed to encode process record: {}", e)))?;
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(path, body).await?;
        Ok(())
    }

    async fn remove_record(&self, id: &ExecutorId) {
        if let Some(path) = self.record_path(id) {
            remove_record_file(&path).await;
        }
    }

    fn command(&self, request: &LaunchRequest) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .env_clear()
            .env("PATH", std::env::var_os("PATH").unwrap_or_default())
            .envs(self.config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(ENV_COORDINATOR_ADDRESS, &request.coordinator_addr)
            .env(ENV_EXECUTOR_TOKEN, request.token.expose())
            .env(ENV_EXECUTOR_PORT, request.port.to_string())
            .env(ENV_EXECUTOR_CLASS, request.executor_class.as_str())
            .env(ENV_EXECUTOR_ID, request.executor_id.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(ref dir) = self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl ExecutorBackend for LocalProcessBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    /// Spawning completes immediately, so the budget never runs out here.
    async fn start_new_executor(
        &self,
        request: &LaunchRequest,
        _budget: Duration,
    ) -> Result<RuntimeRef> {
        let mut child = self.command(request).spawn().map_err(|e| {
            MinerError::Provisioning(format!("failed to spawn {}: {}", self.config.program, e))
        })?;

        let Some(pid) = child.id() else {
            // Already reaped, nothing left to supervise
            let _ = child.wait().await;
            return Err(MinerError::Provisioning(
                "executor process exited before it could be tracked".to_string(),
            ));
        };

        let record = ProcessRecord {
            executor_id: request.executor_id,
            pid,
            port: request.port,
            executor_class: request.executor_class.clone(),
        };
        if let Err(e) = self.write_record(&record).await {
            let _ = child.kill().await;
            return Err(MinerError::Provisioning(format!(
                "failed to record executor process {}: {}",
                pid, e
            )));
        }

        let (kill_tx, kill_rx) = mpsc::channel(1);
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(supervise(
            child,
            pid,
            request.executor_id,
            kill_rx,
            exit_tx,
            self.grace,
        ));

        self.processes.write().await.insert(
            request.executor_id,
            LocalProcess {
                pid,
                kill_tx,
                exit_rx,
            },
        );

        tracing::info!(
            executor_id = %request.executor_id,
            pid,
            port = request.port,
            executor_class = %request.executor_class,
            "Executor process started"
        );
        Ok(RuntimeRef::Process { pid })
    }

    async fn kill_executor(&self, handle: &ExecutorHandle) -> Result<()> {
        let (pid, kill_tx, mut exit_rx) = match self.processes.read().await.get(&handle.id) {
            Some(p) => (p.pid, p.kill_tx.clone(), p.exit_rx.clone()),
            None => return Ok(()),
        };
        if exit_rx.borrow().is_some() {
            return Ok(());
        }

        // A full channel means a kill is already in flight
        let _ = kill_tx.try_send(());
        tracing::debug!(executor_id = %handle.id, pid, "Kill requested");

        let exited = tokio::time::timeout(
            self.grace.saturating_add(KILL_SETTLE),
            exit_rx.wait_for(Option::is_some),
        )
        .await
        .map(|changed| changed.map(|outcome| *outcome));
        let outcome = match exited {
            Ok(Ok(outcome)) => outcome,
            // Supervising task is gone, so the child was reaped
            Ok(Err(_)) => return Ok(()),
            Err(_) => None,
        };

        match outcome {
            Some(ExitOutcome::TerminationFailed) | None => Err(MinerError::Termination {
                executor_id: handle.id,
                grace: self.grace,
            }),
            Some(_) => Ok(()),
        }
    }

    async fn wait_for_executor(&self, handle: &ExecutorHandle, timeout: Duration) -> WaitOutcome {
        let mut exit_rx = match self.processes.read().await.get(&handle.id) {
            Some(p) => p.exit_rx.clone(),
            None => return WaitOutcome::exited(ExitOutcome::Vanished),
        };

        let exited = tokio::time::timeout(timeout, exit_rx.wait_for(Option::is_some))
            .await
            .map(|changed| changed.ok().and_then(|outcome| *outcome));
        match exited {
            Ok(outcome) => WaitOutcome::exited(outcome.unwrap_or(ExitOutcome::Vanished)),
            Err(_) => WaitOutcome::StillRunning,
        }
    }

    async fn get_manifest(&self) -> Manifest {
        self.manifest.clone()
    }

    async fn get_executor_public_address(&self, handle: &ExecutorHandle) -> Option<SocketAddr> {
        let processes = self.processes.read().await;
        processes
            .get(&handle.id)
            .filter(|p| p.exit_rx.borrow().is_none())
            .map(|_| SocketAddr::new(self.public_ip, handle.port))
    }

    /// Children recorded in the state directory that are still alive.
    /// Records of dead processes are dropped on the way.
    async fn inventory(&self) -> Vec<OrphanExecutor> {
        let Some(dir) = self.config.state_dir.as_ref() else {
            return Vec::new();
        };
        let records = match read_records(dir).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Failed to read process records");
                return Vec::new();
            }
        };

        let tracked: HashSet<ExecutorId> = self.processes.read().await.keys().copied().collect();
        let mut orphans = Vec::new();
        for (path, record) in records {
            if tracked.contains(&record.executor_id) {
                continue;
            }
            if process_alive(record.pid) {
                orphans.push(OrphanExecutor::from(record));
            } else {
                tracing::debug!(executor_id = %record.executor_id, pid = record.pid, "Dropping stale process record");
                remove_record_file(&path).await;
            }
        }
        orphans
    }

    /// Signal an orphan the same way a kill does, then drop its record.
    async fn reclaim_orphan(&self, orphan: &OrphanExecutor) -> Result<()> {
        let RuntimeRef::Process { pid } = orphan.runtime else {
            return Err(MinerError::Backend(format!(
                "local backend cannot reclaim {}",
                orphan.runtime
            )));
        };

        if !terminate_orphan(pid, self.grace).await {
            return Err(MinerError::Backend(format!(
                "orphaned process {} survived SIGKILL",
                pid
            )));
        }
        if let Some(id) = orphan.executor_id {
            self.remove_record(&id).await;
        }
        Ok(())
    }

    async fn release_executor(&self, handle: &ExecutorHandle) {
        self.processes.write().await.remove(&handle.id);
        self.remove_record(&handle.id).await;
    }
}

async fn remove_record_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove process record")
        }
    }
}

async fn read_records(dir: &Path) -> std::io::Result<Vec<(PathBuf, ProcessRecord)>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut records = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let body = tokio::fs::read(&path).await?;
        match serde_json::from_slice::<ProcessRecord>(&body) {
            Ok(record) => records.push((path, record)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable process record")
            }
        }
    }
    Ok(records)
}

fn process_alive(pid: u32) -> bool {
    let Ok(raw_pid) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 only checks that the process exists
    !matches!(signal::kill(Pid::from_raw(raw_pid), None), Err(Errno::ESRCH))
}

/// SIGTERM, then SIGKILL after `grace`, for a process this node did not
/// spawn. Returns whether it is gone.
async fn terminate_orphan(pid: u32, grace: Duration) -> bool {
    let Ok(raw_pid) = i32::try_from(pid) else {
        return true;
    };
    let pid_ref = Pid::from_raw(raw_pid);

    for (sig, patience) in [(Signal::SIGTERM, grace), (Signal::SIGKILL, KILL_SETTLE)] {
        match signal::kill(pid_ref, sig) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return true,
            Err(e) => {
                tracing::warn!(pid, signal = ?sig, error = %e, "Failed to signal orphaned process");
                return false;
            }
        }
        let deadline = tokio::time::Instant::now() + patience;
        while tokio::time::Instant::now() < deadline {
            if !process_alive(pid) {
                return true;
            }
            tokio::time::sleep(ORPHAN_POLL).await;
        }
        tracing::warn!(pid, signal = ?sig, "Orphaned process still running");
    }
    !process_alive(pid)
}

/// Owns one child until it exits, escalating SIGTERM → SIGKILL on request.
async fn supervise(
    mut child: Child,
    pid: u32,
    executor_id: ExecutorId,
    mut kill_rx: mpsc::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
    grace: Duration,
) {
    let outcome = tokio::select! {
        status = child.wait() => outcome_from_status(status),
        Some(()) = kill_rx.recv() => terminate(&mut child, pid, grace).await,
    };

    tracing::info!(executor_id = %executor_id, pid, outcome = %outcome, "Executor process exited");
    exit_tx.send_replace(Some(outcome));
}

async fn terminate(child: &mut Child, pid: u32, grace: Duration) -> ExitOutcome {
    let Ok(raw_pid) = i32::try_from(pid) else {
        return ExitOutcome::TerminationFailed;
    };
    match signal::kill(Pid::from_raw(raw_pid), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid, error = %e, "Failed to send SIGTERM"),
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(_)) => return ExitOutcome::Killed,
        Ok(Err(e)) => tracing::warn!(pid, error = %e, "Waiting for executor failed"),
        Err(_) => tracing::warn!(pid, grace = ?grace, "Executor ignored SIGTERM, sending SIGKILL"),
    }

    match child.kill().await {
        Ok(()) => ExitOutcome::Killed,
        Err(e) => {
            tracing::error!(pid, error = %e, "Failed to kill executor");
            ExitOutcome::TerminationFailed
        }
    }
}

fn outcome_from_status(status: std::io::Result<ExitStatus>) -> ExitOutcome {
    match status {
        Ok(status) => match (status.code(), status.signal()) {
            (Some(code), _) => ExitOutcome::Completed { code },
            (None, Some(signal)) => ExitOutcome::Signalled { signal },
            (None, None) => ExitOutcome::Vanished,
        },
        Err(e) => {
            tracing::warn!(error = %e, "Failed to collect executor exit status");
            ExitOutcome::Vanished
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn exit_code_maps_to_completed() {
        let status = ExitStatus::from_raw(3 << 8);
        assert_eq!(
            outcome_from_status(Ok(status)),
            ExitOutcome::Completed { code: 3 }
        );
    }

    #[test]
    fn signal_maps_to_signalled() {
        let status = ExitStatus::from_raw(9);
        assert_eq!(
            outcome_from_status(Ok(status)),
            ExitOutcome::Signalled { signal: 9 }
        );
    }

    #[test]
    fn missing_pid_is_not_alive() {
        assert!(!process_alive(999_999_999));
        assert!(!process_alive(u32::MAX));
        assert!(process_alive(std::process::id()));
    }

    #[test]
    fn record_becomes_orphan() {
        let id = ExecutorId::new();
        let orphan = OrphanExecutor::from(ProcessRecord {
            executor_id: id,
            pid: 4242,
            port: 9100,
            executor_class: ExecutorClass::new("cpu-basic"),
        });
        assert_eq!(orphan.runtime, RuntimeRef::Process { pid: 4242 });
        assert_eq!(orphan.executor_id, Some(id));
        assert_eq!(orphan.port, Some(9100));
    }

    #[test]
    fn wait_error_maps_to_vanished() {
        let err = std::io::Error::other("gone");
        assert_eq!(outcome_from_status(Err(err)), ExitOutcome::Vanished);
    }
}
