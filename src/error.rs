use std::time::Duration;

use thiserror::Error;

use crate::executor::{ExecutorClass, ExecutorId};

#[derive(Error, Debug)]
pub enum MinerError {
    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    #[error("No free port in range {start}-{end}")]
    PortsExhausted { start: u16, end: u16 },

    #[error("No free capacity for executor class {executor_class}")]
    CapacityExhausted { executor_class: ExecutorClass },

    #[error("Executor {executor_id} did not terminate within {grace:?}")]
    Termination {
        executor_id: ExecutorId,
        grace: Duration,
    },

    #[error("Address of executor {0} is not available yet")]
    AddressUnavailable(ExecutorId),

    #[error("Executor not found: {0}")]
    UnknownExecutor(ExecutorId),

    #[error("Token is already bound to a live executor")]
    TokenInUse,

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MinerError {
    /// Short stable label for logs and API error bodies.
    pub fn as_label(&self) -> &'static str {
        match self {
            MinerError::Provisioning(_) => "provisioning_failed",
            MinerError::PortsExhausted { .. } => "ports_exhausted",
            MinerError::CapacityExhausted { .. } => "capacity_exhausted",
            MinerError::Termination { .. } => "termination_failed",
            MinerError::AddressUnavailable(_) => "address_unavailable",
            MinerError::UnknownExecutor(_) => "unknown_executor",
            MinerError::TokenInUse => "token_in_use",
            MinerError::Backend(_) => "backend_error",
            MinerError::Config(_) => "invalid_config",
            MinerError::Io(_) => "io_error",
        }
    }

    /// Backpressure signals tell the dispatcher to stop routing work here
    /// until capacity frees up. They are not faults.
    pub fn is_backpressure(&self) -> bool {
        matches!(
            self,
            MinerError::PortsExhausted { .. } | MinerError::CapacityExhausted { .. }
        )
    }

    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        self.is_backpressure()
            || matches!(
                self,
                MinerError::Provisioning(_) | MinerError::AddressUnavailable(_)
            )
    }
}

pub type Result<T> = std::result::Result<T, MinerError>;
