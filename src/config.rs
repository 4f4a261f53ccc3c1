use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{MinerError, Result};
use crate::executor::ExecutorClass;

/// Inclusive range of local ports handed out to executors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Number of ports in the range.
    pub fn len(&self) -> u32 {
        if self.end < self.start {
            0
        } else {
            u32::from(self.end - self.start) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self::new(6000, 6999)
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Which executor backend the node runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum BackendKind {
    /// One OS process per executor. Development only.
    #[default]
    Local,
    /// One docker container per executor.
    Docker,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::Docker => write!(f, "docker"),
        }
    }
}

/// Configuration for the local-process backend.
#[derive(Debug, Clone)]
pub struct LocalBackendConfig {
    /// Program launched for every executor
    pub program: String,
    pub args: Vec<String>,
    /// Working directory of the executor process
    pub working_dir: Option<PathBuf>,
    /// Extra environment passed on top of `PATH` and the injected variables
    pub env: Vec<(String, String)>,
    /// Where running children are recorded so a restarted node can reclaim
    /// them. Without it a crashed node's children go unnoticed.
    pub state_dir: Option<PathBuf>,
}

impl Default for LocalBackendConfig {
    fn default() -> Self {
        Self {
            program: "executor".to_string(),
            args: vec!["run".to_string()],
            working_dir: None,
            env: Vec::new(),
            state_dir: None,
        }
    }
}

/// Configuration for docker-based executors.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Path or name of the docker CLI
    pub docker_bin: String,
    /// Executor image
    pub image: String,
    /// Memory limit (e.g., "16g")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "4")
    pub cpu_limit: Option<String>,
    /// Value for `--gpus` (e.g., "all")
    pub gpus: Option<String>,
    /// Docker network to attach executors to
    pub network: Option<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            image: "compute-executor:latest".to_string(),
            memory_limit: None,
            cpu_limit: None,
            gpus: None,
            network: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Name of this node; labels everything the node provisions
    pub node_name: String,
    pub backend: BackendKind,
    pub port_range: PortRange,
    /// Skip ports that fail an OS bind probe when acquiring
    pub probe_ports: bool,
    pub default_executor_class: ExecutorClass,
    /// Declared maximum concurrency per executor class
    pub executor_classes: BTreeMap<ExecutorClass, u32>,
    /// Address executors call back to (e.g., "ws://10.0.0.1:8000")
    pub coordinator_addr: String,
    /// IP peers use to reach executors on this host
    pub public_ip: IpAddr,
    pub kill_grace_ms: u64,
    pub reap_interval_ms: u64,
    /// Control API listen address (optional)
    pub api_addr: Option<SocketAddr>,
    pub local: LocalBackendConfig,
    pub docker: DockerConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let default_class = ExecutorClass::default();
        let mut executor_classes = BTreeMap::new();
        executor_classes.insert(default_class.clone(), 1);

        Self {
            node_name: "miner-lite".to_string(),
            backend: BackendKind::Local,
            port_range: PortRange::default(),
            probe_ports: true,
            default_executor_class: default_class,
            executor_classes,
            coordinator_addr: "ws://127.0.0.1:8000".to_string(),
            public_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            kill_grace_ms: 5000,
            reap_interval_ms: 1000,
            api_addr: None,
            local: LocalBackendConfig::default(),
            docker: DockerConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(node_name: impl Into<String>, backend: BackendKind) -> Self {
        Self {
            node_name: node_name.into(),
            backend,
            ..Default::default()
        }
    }

    pub fn with_port_range(mut self, start: u16, end: u16) -> Self {
        self.port_range = PortRange::new(start, end);
        self
    }

    /// Declare capacity for an additional class.
    pub fn with_executor_class(mut self, class: impl Into<ExecutorClass>, capacity: u32) -> Self {
        self.executor_classes.insert(class.into(), capacity);
        self
    }

    /// Replace all declared classes with a single one, which becomes the default.
    pub fn with_only_class(mut self, class: impl Into<ExecutorClass>, capacity: u32) -> Self {
        let class = class.into();
        self.executor_classes.clear();
        self.executor_classes.insert(class.clone(), capacity);
        self.default_executor_class = class;
        self
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port_range.is_empty() {
            return Err(MinerError::Config(format!(
                "port range {} is empty",
                self.port_range
            )));
        }
        if self.port_range.start == 0 {
            return Err(MinerError::Config("port 0 cannot be leased".to_string()));
        }
        if self.executor_classes.is_empty() {
            return Err(MinerError::Config(
                "at least one executor class must be declared".to_string(),
            ));
        }
        if !self
            .executor_classes
            .contains_key(&self.default_executor_class)
        {
            return Err(MinerError::Config(format!(
                "default executor class {} has no declared capacity",
                self.default_executor_class
            )));
        }
        if self.kill_grace_ms == 0 {
            return Err(MinerError::Config(
                "kill grace period must be positive".to_string(),
            ));
        }
        if self.reap_interval_ms == 0 {
            return Err(MinerError::Config(
                "reap interval must be positive".to_string(),
            ));
        }
        if self.coordinator_addr.is_empty() {
            return Err(MinerError::Config(
                "coordinator address is required".to_string(),
            ));
        }
        Ok(())
    }
}
