//! Executor provisioning backends.
//!
//! Every backend implements [`ExecutorBackend`]; the node picks one at
//! startup from [`BackendKind`] and hands it to the
//! [`LifecycleSupervisor`](crate::supervisor::LifecycleSupervisor) as a
//! trait object.
//!
//! # Backends
//!
//! - [`LocalProcessBackend`]: one child process per executor, for development
//! - [`DockerBackend`]: one container per executor, via the docker CLI
//!
//! # Injected environment
//!
//! Executors learn where to call back and how to authenticate from:
//! `COORDINATOR_ADDRESS`, `EXECUTOR_TOKEN`, `EXECUTOR_PORT`,
//! `EXECUTOR_CLASS` and `EXECUTOR_ID`.

pub mod backend;
pub mod class;
pub mod docker;
pub mod handle;
pub mod local;

use std::sync::Arc;

pub use backend::ExecutorBackend;
pub use class::{ExecutorClass, Manifest, DEFAULT_EXECUTOR_CLASS};
pub use docker::DockerBackend;
pub use handle::{
    ExecutorHandle, ExecutorId, ExecutorInfo, ExecutorState, ExecutorToken, ExitOutcome,
    LaunchRequest, OrphanExecutor, RuntimeRef, WaitOutcome,
};
pub use local::LocalProcessBackend;

use crate::config::{BackendKind, NodeConfig};

/// Build the backend the configuration asks for.
pub fn build_backend(config: &NodeConfig) -> Arc<dyn ExecutorBackend> {
    match config.backend {
        BackendKind::Local => Arc::new(LocalProcessBackend::from_node_config(config)),
        BackendKind::Docker => Arc::new(DockerBackend::from_node_config(config)),
    }
}
