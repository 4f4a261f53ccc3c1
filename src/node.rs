use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::{run_api, ApiState};
use crate::config::NodeConfig;
use crate::error::Result;
use crate::executor::{build_backend, ExecutorBackend};
use crate::ports::PortAllocator;
use crate::supervisor::{LifecycleSupervisor, SupervisorConfig};

/// Compute-provider node: owns the port pool and the supervisor, and runs
/// the reaper and the control API around them.
pub struct Node {
    pub config: NodeConfig,
    pub ports: Arc<PortAllocator>,
    pub supervisor: LifecycleSupervisor,
}

impl Node {
    /// Build a node with the backend `config.backend` selects.
    ///
    /// # Errors
    ///
    /// Returns [`MinerError::Config`](crate::error::MinerError::Config) if the
    /// configuration is invalid.
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        let backend = build_backend(&config);
        Ok(Self::with_backend(config, backend))
    }

    pub fn with_backend(config: NodeConfig, backend: Arc<dyn ExecutorBackend>) -> Self {
        let ports =
            Arc::new(PortAllocator::new(config.port_range).with_probe(config.probe_ports));
        let supervisor = LifecycleSupervisor::new(
            backend,
            ports.clone(),
            SupervisorConfig::from_node_config(&config),
        );
        Self {
            config,
            ports,
            supervisor,
        }
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            supervisor: self.supervisor.clone(),
            node_name: self.config.node_name.clone(),
            default_executor_class: self.config.default_executor_class.clone(),
        }
    }

    /// Run the node until `shutdown` is cancelled.
    ///
    /// 1. Reconciles against the backend's runtime inventory
    /// 2. Spawns the reaper
    /// 3. Spawns the control API if an address is configured
    /// 4. On shutdown, stops both and terminates every live executor
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let report = self.supervisor.reconcile().await;
        if report != Default::default() {
            tracing::info!(
                reclaimed = report.reclaimed,
                failed = report.failed,
                quarantined_ports = ?report.quarantined_ports,
                "Reconciled executors left by a previous run"
            );
        }

        let reaper = {
            let supervisor = self.supervisor.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { supervisor.run_reaper(shutdown).await })
        };

        let api = self.config.api_addr.map(|addr| {
            let state = self.api_state();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { run_api(addr, state, shutdown).await })
        });

        tracing::info!(
            node = %self.config.node_name,
            backend = %self.config.backend,
            port_range = %self.config.port_range,
            manifest = ?self.supervisor.manifest().await,
            "Node ready"
        );

        shutdown.cancelled().await;

        self.supervisor.shutdown().await;
        if let Err(e) = reaper.await {
            tracing::warn!(error = %e, "Reaper task ended abnormally");
        }
        if let Some(api) = api {
            if let Err(e) = api.await {
                tracing::warn!(error = %e, "Control API task ended abnormally");
            }
        }

        tracing::info!(node = %self.config.node_name, "Node stopped");
        Ok(())
    }
}
