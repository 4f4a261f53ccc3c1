pub mod api;
pub mod backoff;
pub mod config;
pub mod error;
pub mod executor;
pub mod node;
pub mod ports;
pub mod shutdown;
pub mod supervisor;

pub use error::{MinerError, Result};
pub use supervisor::LifecycleSupervisor;
