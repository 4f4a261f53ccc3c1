use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;

use super::class::Manifest;
use super::handle::{ExecutorHandle, LaunchRequest, OrphanExecutor, RuntimeRef, WaitOutcome};
use crate::error::Result;

/// Contract every executor backend implements.
///
/// The supervisor is the only caller. Kill and wait must tolerate being
/// called for workers that are already gone, in any order and from
/// concurrent tasks.
#[async_trait]
pub trait ExecutorBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Provision one worker. An expired `budget` must not leave a partially
    /// started worker behind.
    async fn start_new_executor(
        &self,
        request: &LaunchRequest,
        budget: Duration,
    ) -> Result<RuntimeRef>;

    /// Terminate the worker, escalating from graceful to forceful. A no-op
    /// for unknown or exited workers.
    async fn kill_executor(&self, handle: &ExecutorHandle) -> Result<()>;

    /// Wait up to `timeout` for the worker to exit.
    async fn wait_for_executor(&self, handle: &ExecutorHandle, timeout: Duration) -> WaitOutcome;

    /// Capacity this backend can promise. Must not fail; report zero when
    /// the backend cannot be reached.
    async fn get_manifest(&self) -> Manifest;

    /// Endpoint peers use to reach the worker. `None` until assigned.
    async fn get_executor_public_address(&self, handle: &ExecutorHandle) -> Option<SocketAddr>;

    /// Workers this node owns according to the backend runtime.
    async fn inventory(&self) -> Vec<OrphanExecutor> {
        Vec::new()
    }

    /// Tear down a worker found by [`ExecutorBackend::inventory`].
    async fn reclaim_orphan(&self, _orphan: &OrphanExecutor) -> Result<()> {
        Ok(())
    }

    /// Drop backend-side bookkeeping once the supervisor deregistered the
    /// handle.
    async fn release_executor(&self, _handle: &ExecutorHandle) {}
}
