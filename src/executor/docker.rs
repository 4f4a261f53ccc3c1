use std::collections::HashSet;
use std::ffi::OsStr;
use std::net::{IpAddr, SocketAddr};
use std::process::{Output, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

use super::backend::ExecutorBackend;
use super::class::{ExecutorClass, Manifest};
use super::handle::{
    ExecutorHandle, ExecutorId, ExitOutcome, LaunchRequest, OrphanExecutor, RuntimeRef,
    WaitOutcome,
};
use super::local::{
    ENV_COORDINATOR_ADDRESS, ENV_EXECUTOR_CLASS, ENV_EXECUTOR_ID, ENV_EXECUTOR_PORT,
    ENV_EXECUTOR_TOKEN,
};
use crate::config::{DockerConfig, NodeConfig};
use crate::error::{MinerError, Result};

pub const LABEL_NODE: &str = "miner-lite.node";
pub const LABEL_EXECUTOR: &str = "miner-lite.executor";
pub const LABEL_CLASS: &str = "miner-lite.class";
pub const LABEL_PORT: &str = "miner-lite.port";

const CONTAINER_PREFIX: &str = "miner-executor-";
const KILL_SETTLE: Duration = Duration::from_secs(5);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on `docker rm -f`; shorter than the supervisor's start slack so a
/// half-started container is gone before its port is handed out again.
const REMOVE_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs every executor in its own docker container.
///
/// Containers carry labels naming the node, executor, class and port so a
/// restarted node can find what it left behind.
pub struct DockerBackend {
    config: DockerConfig,
    node_name: String,
    quotas: Manifest,
    public_ip: IpAddr,
    grace: Duration,
    /// Executors stopped on request, so their exit reads as `Killed`
    killed: Mutex<HashSet<ExecutorId>>,
}

impl DockerBackend {
    pub fn new(
        config: DockerConfig,
        node_name: impl Into<String>,
        quotas: Manifest,
        public_ip: IpAddr,
        grace: Duration,
    ) -> Self {
        Self {
            config,
            node_name: node_name.into(),
            quotas,
            public_ip,
            grace,
            killed: Mutex::new(HashSet::new()),
        }
    }

    pub fn from_node_config(config: &NodeConfig) -> Self {
        Self::new(
            config.docker.clone(),
            config.node_name.clone(),
            Manifest::from(config.executor_classes.clone()),
            config.public_ip,
            config.kill_grace(),
        )
    }

    async fn docker<I, S>(&self, args: I) -> std::io::Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Command::new(&self.config.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
    }

    /// `docker rm -f`, treating a missing container as success.
    async fn force_remove(&self, name: &str) -> Result<()> {
        let output = tokio::time::timeout(REMOVE_TIMEOUT, self.docker(["rm", "-f", name]))
            .await
            .map_err(|_| {
                MinerError::Backend(format!(
                    "docker rm -f {} did not finish within {:?}",
                    name, REMOVE_TIMEOUT
                ))
            })??;
        if output.status.success() || is_missing_container(&output.stderr) {
            Ok(())
        } else {
            Err(MinerError::Backend(stderr_text(&output)))
        }
    }

    /// Whether the container is running. A missing container counts as
    /// stopped; `None` when docker could not tell.
    async fn is_running(&self, name: &str) -> Option<bool> {
        let inspect = self.docker(["inspect", "--format", "{{.State.Running}}", name]);
        let output = tokio::time::timeout(PROBE_TIMEOUT, inspect).await.ok()?.ok()?;
        if output.status.success() {
            Some(String::from_utf8_lossy(&output.stdout).trim() == "true")
        } else if is_missing_container(&output.stderr) {
            Some(false)
        } else {
            None
        }
    }

    fn mark_killed(&self, id: ExecutorId) {
        self.killed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id);
    }

    fn was_killed(&self, id: &ExecutorId) -> bool {
        self.killed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(id)
    }

    fn forget_killed(&self, id: &ExecutorId) {
        self.killed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(id);
    }
}

pub fn container_name(id: &ExecutorId) -> String {
    format!("{}{}", CONTAINER_PREFIX, id)
}

/// Arguments for `docker run`. The token is passed by name only and read
/// from the CLI's environment so it never shows up in a process listing.
pub fn run_args(config: &DockerConfig, node_name: &str, request: &LaunchRequest) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        container_name(&request.executor_id),
    ];

    for (key, value) in [
        (LABEL_NODE, node_name.to_string()),
        (LABEL_EXECUTOR, request.executor_id.to_string()),
        (LABEL_CLASS, request.executor_class.to_string()),
        (LABEL_PORT, request.port.to_string()),
    ] {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }

    for (key, value) in [
        (ENV_COORDINATOR_ADDRESS, request.coordinator_addr.clone()),
        (ENV_EXECUTOR_PORT, request.port.to_string()),
        (ENV_EXECUTOR_CLASS, request.executor_class.to_string()),
        (ENV_EXECUTOR_ID, request.executor_id.to_string()),
    ] {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.push("-e".to_string());
    args.push(ENV_EXECUTOR_TOKEN.to_string());

    args.push("-p".to_string());
    args.push(format!("{}:{}", request.port, request.port));

    if let Some(ref limit) = config.memory_limit {
        args.push(format!("--memory={}", limit));
    }
    if let Some(ref limit) = config.cpu_limit {
        args.push(format!("--cpus={}", limit));
    }
    if let Some(ref gpus) = config.gpus {
        args.push(format!("--gpus={}", gpus));
    }
    if let Some(ref network) = config.network {
        args.push(format!("--network={}", network));
    }

    args.push("--cap-drop=ALL".to_string());
    args.push("--security-opt=no-new-privileges".to_string());
    args.push(config.image.clone());
    args
}

/// Parse `docker port` output, rewriting wildcard binds to `public_ip`.
pub fn parse_port_output(stdout: &str, public_ip: IpAddr) -> Option<SocketAddr> {
    stdout
        .lines()
        .filter_map(|line| line.trim().parse::<SocketAddr>().ok())
        .find(|addr| addr.is_ipv4())
        .map(|addr| {
            if addr.ip().is_unspecified() {
                SocketAddr::new(public_ip, addr.port())
            } else {
                addr
            }
        })
}

/// Parse tab-separated `docker ps` rows: name, executor id, class, port.
pub fn parse_inventory(stdout: &str) -> Vec<OrphanExecutor> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let name = fields.next()?.trim();
            if name.is_empty() {
                return None;
            }
            let executor_id = fields.next().and_then(|f| f.trim().parse().ok());
            let executor_class = fields
                .next()
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(ExecutorClass::new);
            let port = fields.next().and_then(|f| f.trim().parse().ok());
            Some(OrphanExecutor {
                runtime: RuntimeRef::Container {
                    name: name.to_string(),
                },
                executor_id,
                executor_class,
                port,
            })
        })
        .collect()
}

fn is_missing_container(stderr: &[u8]) -> bool {
    String::from_utf8_lossy(stderr).contains("No such container")
}

fn stderr_text(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        format!("docker exited with {:?}", output.status.code())
    } else {
        stderr
    }
}

fn runtime_name(handle: &ExecutorHandle) -> String {
    match handle.runtime {
        RuntimeRef::Container { ref name } => name.clone(),
        RuntimeRef::Process { .. } => container_name(&handle.id),
    }
}

#[async_trait]
impl ExecutorBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn start_new_executor(
        &self,
        request: &LaunchRequest,
        budget: Duration,
    ) -> Result<RuntimeRef> {
        let name = container_name(&request.executor_id);
        let args = run_args(&self.config, &self.node_name, request);

        tracing::info!(
            executor_id = %request.executor_id,
            image = %self.config.image,
            port = request.port,
            executor_class = %request.executor_class,
            "Starting executor container"
        );

        let run = Command::new(&self.config.docker_bin)
            .args(&args)
            .env(ENV_EXECUTOR_TOKEN, request.token.expose())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(budget, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(MinerError::Provisioning(format!(
                    "failed to run {}: {}",
                    self.config.docker_bin, e
                )))
            }
            Err(_) => {
                // The container may exist even though `docker run` never answered
                if let Err(e) = self.force_remove(&name).await {
                    tracing::warn!(container = %name, error = %e, "Failed to remove half-started container");
                }
                return Err(MinerError::Provisioning(format!(
                    "start budget of {:?} expired",
                    budget
                )));
            }
        };

        if !output.status.success() {
            let _ = self.force_remove(&name).await;
            return Err(MinerError::Provisioning(stderr_text(&output)));
        }

        Ok(RuntimeRef::Container { name })
    }

    async fn kill_executor(&self, handle: &ExecutorHandle) -> Result<()> {
        let name = runtime_name(handle);
        if self.is_running(&name).await == Some(false) {
            tracing::debug!(container = %name, "Container already stopped");
            return Ok(());
        }

        let grace_secs = self.grace.as_secs().max(1).to_string();
        let stop = self.docker(["stop", "-t", grace_secs.as_str(), name.as_str()]);
        match tokio::time::timeout(self.grace.saturating_add(KILL_SETTLE), stop).await {
            Ok(Ok(output)) if output.status.success() => {
                self.mark_killed(handle.id);
                return Ok(());
            }
            Ok(Ok(output)) if is_missing_container(&output.stderr) => return Ok(()),
            Ok(Ok(output)) => {
                tracing::warn!(container = %name, error = %stderr_text(&output), "docker stop failed")
            }
            Ok(Err(e)) => tracing::warn!(container = %name, error = %e, "docker stop failed"),
            Err(_) => tracing::warn!(container = %name, "docker stop timed out"),
        }

        let kill = self.docker(["kill", name.as_str()]);
        match tokio::time::timeout(KILL_SETTLE, kill).await {
            Ok(Ok(output)) if output.status.success() => {
                self.mark_killed(handle.id);
                Ok(())
            }
            Ok(Ok(output)) if is_missing_container(&output.stderr) => Ok(()),
            _ => Err(MinerError::Termination {
                executor_id: handle.id,
                grace: self.grace,
            }),
        }
    }

    async fn wait_for_executor(&self, handle: &ExecutorHandle, timeout: Duration) -> WaitOutcome {
        let started = Instant::now();
        let name = runtime_name(handle);

        let output = match tokio::time::timeout(timeout, self.docker(["wait", name.as_str()])).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                tracing::warn!(container = %name, error = %e, "docker wait failed");
                tokio::time::sleep(timeout.saturating_sub(started.elapsed())).await;
                return WaitOutcome::StillRunning;
            }
            Err(_) => return WaitOutcome::StillRunning,
        };

        if !output.status.success() {
            if is_missing_container(&output.stderr) {
                return WaitOutcome::exited(ExitOutcome::Vanished);
            }
            tracing::warn!(container = %name, error = %stderr_text(&output), "docker wait failed");
            tokio::time::sleep(timeout.saturating_sub(started.elapsed())).await;
            return WaitOutcome::StillRunning;
        }

        if self.was_killed(&handle.id) {
            return WaitOutcome::exited(ExitOutcome::Killed);
        }
        let code = String::from_utf8_lossy(&output.stdout).trim().parse::<i32>();
        match code {
            Ok(code) => WaitOutcome::exited(ExitOutcome::Completed { code }),
            Err(_) => WaitOutcome::exited(ExitOutcome::Vanished),
        }
    }

    async fn get_manifest(&self) -> Manifest {
        let probe = self.docker(["info", "--format", "{{.ServerVersion}}"]);
        match tokio::time::timeout(PROBE_TIMEOUT, probe).await {
            Ok(Ok(output)) if output.status.success() => self.quotas.clone(),
            Ok(Ok(output)) => {
                tracing::warn!(error = %stderr_text(&output), "Docker daemon unavailable, reporting zero capacity");
                self.quotas.zeroed()
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Docker CLI unavailable, reporting zero capacity");
                self.quotas.zeroed()
            }
            Err(_) => {
                tracing::warn!("Docker daemon probe timed out, reporting zero capacity");
                self.quotas.zeroed()
            }
        }
    }

    async fn get_executor_public_address(&self, handle: &ExecutorHandle) -> Option<SocketAddr> {
        let name = runtime_name(handle);
        let port = format!("{}/tcp", handle.port);
        let output = tokio::time::timeout(
            PROBE_TIMEOUT,
            self.docker(["port", name.as_str(), port.as_str()]),
        )
        .await
        .ok()?
        .ok()?;
        if !output.status.success() {
            return None;
        }
        parse_port_output(&String::from_utf8_lossy(&output.stdout), self.public_ip)
    }

    async fn inventory(&self) -> Vec<OrphanExecutor> {
        let filter = format!("label={}={}", LABEL_NODE, self.node_name);
        let format = format!(
            "{{{{.Names}}}}\t{{{{.Label \"{}\"}}}}\t{{{{.Label \"{}\"}}}}\t{{{{.Label \"{}\"}}}}",
            LABEL_EXECUTOR, LABEL_CLASS, LABEL_PORT
        );
        match self
            .docker(["ps", "-a", "--filter", filter.as_str(), "--format", format.as_str()])
            .await
        {
            Ok(output) if output.status.success() => {
                parse_inventory(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(output) => {
                tracing::warn!(error = %stderr_text(&output), "Failed to list executor containers");
                Vec::new()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list executor containers");
                Vec::new()
            }
        }
    }

    async fn reclaim_orphan(&self, orphan: &OrphanExecutor) -> Result<()> {
        match orphan.runtime {
            RuntimeRef::Container { ref name } => self.force_remove(name).await,
            RuntimeRef::Process { pid } => Err(MinerError::Backend(format!(
                "docker backend cannot reclaim process {}",
                pid
            ))),
        }
    }

    async fn release_executor(&self, handle: &ExecutorHandle) {
        let name = runtime_name(handle);
        if let Err(e) = self.force_remove(&name).await {
            tracing::warn!(container = %name, error = %e, "Failed to remove executor container");
        }
        self.forget_killed(&handle.id);
    }
}
