//! Executor lifecycle supervision.
//!
//! The [`LifecycleSupervisor`] is the only component that mutates the
//! combined handle set and port pool. Two steps are atomic with respect to
//! each other because both run under the registry write lock:
//!
//! - registration: capacity check, port acquisition, `Starting` entry
//! - deregistration: entry removal, port release, terminal state
//!
//! # Lifecycle
//!
//! ```text
//! start ──► acquire port ──► backend.start ──► Running ──► watcher task
//!                                                │
//!        wait / kill / watcher / reaper ─────────┴──► finalize (once)
//!                                                       ├─ release port
//!                                                       ├─ Exited | Failed
//!                                                       └─ backend.release
//! ```
//!
//! Every executor gets a watcher task that waits for it until its deadline
//! and terminates it with [`ExitOutcome::TimedOut`] when the deadline
//! passes. [`LifecycleSupervisor::run_reaper`] sweeps the handle set
//! periodically as a safety net for executors nobody waits on.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffPolicy;
use crate::config::NodeConfig;
use crate::error::{MinerError, Result};
use crate::executor::{
    ExecutorBackend, ExecutorClass, ExecutorHandle, ExecutorId, ExecutorState, ExecutorToken,
    ExitOutcome, LaunchRequest, Manifest, WaitOutcome,
};
use crate::ports::PortAllocator;

/// Extra time a backend gets on top of the caller's budget before the
/// supervisor stops waiting for it.
const START_SLACK: Duration = Duration::from_secs(5);
/// Overhead allowed on top of a caller's wait timeout.
const WAIT_SLACK: Duration = Duration::from_millis(100);
/// How long to wait for the exit status after a successful kill.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);
/// Stand-in for deadlines too far out to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);
const ADDRESS_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const REAP_PROBE_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Address executors call back to
    pub coordinator_addr: String,
    pub kill_grace: Duration,
    pub reap_interval: Duration,
    /// Delays between address resolution attempts
    pub address_backoff: BackoffPolicy,
    /// How long the backend gets to report its manifest before the node
    /// reports zero capacity
    pub manifest_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            coordinator_addr: "ws://127.0.0.1:8000".to_string(),
            kill_grace: Duration::from_secs(5),
            reap_interval: Duration::from_secs(1),
            address_backoff: BackoffPolicy::default(),
            manifest_timeout: Duration::from_secs(10),
        }
    }
}

impl SupervisorConfig {
    pub fn from_node_config(config: &NodeConfig) -> Self {
        Self {
            coordinator_addr: config.coordinator_addr.clone(),
            kill_grace: config.kill_grace(),
            reap_interval: config.reap_interval(),
            ..Self::default()
        }
    }
}

/// What [`LifecycleSupervisor::reconcile`] found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub reclaimed: usize,
    pub failed: usize,
    /// Ports kept out of circulation because their orphan could not be reclaimed
    pub quarantined_ports: Vec<u16>,
}

struct Tracked {
    request: LaunchRequest,
    /// Set once the backend reported the worker started
    handle: Option<ExecutorHandle>,
    state_tx: watch::Sender<ExecutorState>,
    deadline: Instant,
    /// Stops the watcher task
    cancel: CancellationToken,
}

impl Tracked {
    fn transition(&self, next: ExecutorState) -> bool {
        self.state_tx.send_if_modified(|state| {
            if state.can_transition_to(&next) {
                *state = next;
                true
            } else {
                false
            }
        })
    }
}

struct Inner {
    backend: Arc<dyn ExecutorBackend>,
    ports: Arc<PortAllocator>,
    config: SupervisorConfig,
    registry: RwLock<HashMap<ExecutorId, Tracked>>,
    /// Last manifest the backend reported, used when it stops answering
    last_declared: Mutex<Manifest>,
    shutdown: CancellationToken,
}

/// Tracks every live executor and keeps handles, ports and capacity
/// consistent.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LifecycleSupervisor {
    inner: Arc<Inner>,
}

impl LifecycleSupervisor {
    pub fn new(
        backend: Arc<dyn ExecutorBackend>,
        ports: Arc<PortAllocator>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                ports,
                config,
                registry: RwLock::new(HashMap::new()),
                last_declared: Mutex::new(Manifest::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.inner.ports
    }

    /// Provision one executor of `executor_class`.
    ///
    /// `timeout` bounds provisioning and is the executor's lifetime: once it
    /// elapses after the executor started, the executor is terminated.
    ///
    /// # Errors
    ///
    /// - [`MinerError::CapacityExhausted`] / [`MinerError::PortsExhausted`]
    ///   when the node is full (backpressure)
    /// - [`MinerError::TokenInUse`] when `token` already belongs to a live executor
    /// - [`MinerError::Provisioning`] when the backend cannot start the worker
    pub async fn start(
        &self,
        token: ExecutorToken,
        executor_class: ExecutorClass,
        timeout: Duration,
    ) -> Result<ExecutorHandle> {
        if self.inner.shutdown.is_cancelled() {
            return Err(MinerError::Provisioning(
                "node is shutting down".to_string(),
            ));
        }

        let declared = self.declared_manifest().await;
        let executor_id = ExecutorId::new();
        let deadline = deadline_after(timeout);
        let (request, state_rx) = {
            let mut registry = self.inner.registry.write().await;

            if !declared.contains(&executor_class) {
                return Err(MinerError::Provisioning(format!(
                    "executor class {} is not offered by this node",
                    executor_class
                )));
            }
            if registry.values().any(|t| t.request.token == token) {
                return Err(MinerError::TokenInUse);
            }
            let active = registry
                .values()
                .filter(|t| t.request.executor_class == executor_class)
                .count();
            if active >= declared.count(&executor_class) as usize {
                return Err(MinerError::CapacityExhausted { executor_class });
            }

            let port = self.inner.ports.acquire(executor_id)?;
            let request = LaunchRequest {
                executor_id,
                token,
                executor_class,
                port,
                coordinator_addr: self.inner.config.coordinator_addr.clone(),
            };
            let (state_tx, state_rx) = watch::channel(ExecutorState::Starting);
            registry.insert(
                executor_id,
                Tracked {
                    request: request.clone(),
                    handle: None,
                    state_tx,
                    deadline,
                    cancel: self.inner.shutdown.child_token(),
                },
            );
            (request, state_rx)
        };

        let started = tokio::time::timeout(
            timeout.saturating_add(START_SLACK),
            self.inner.backend.start_new_executor(&request, timeout),
        )
        .await;
        let runtime = match started {
            Ok(Ok(runtime)) => runtime,
            Ok(Err(e)) => {
                tracing::warn!(
                    executor_id = %executor_id,
                    executor_class = %request.executor_class,
                    error = %e,
                    "Executor failed to start"
                );
                self.abandon(executor_id).await;
                return Err(e);
            }
            Err(_) => {
                tracing::warn!(executor_id = %executor_id, "Backend did not answer within the start budget");
                self.abandon(executor_id).await;
                return Err(MinerError::Provisioning(format!(
                    "backend did not start the executor within {:?}",
                    timeout
                )));
            }
        };

        let handle = ExecutorHandle::new(&request, runtime, state_rx);
        let deadline = deadline_after(timeout);
        let registered = {
            let mut registry = self.inner.registry.write().await;
            match registry.get_mut(&executor_id) {
                Some(tracked) if !self.inner.shutdown.is_cancelled() => {
                    tracked.handle = Some(handle.clone());
                    tracked.deadline = deadline;
                    tracked.transition(ExecutorState::Running);
                    Some(tracked.cancel.clone())
                }
                _ => None,
            }
        };
        let Some(cancel) = registered else {
            // Shutdown raced the start; do not leave the worker behind
            if let Err(e) = self.inner.backend.kill_executor(&handle).await {
                tracing::warn!(executor_id = %executor_id, error = %e, "Failed to kill executor started during shutdown");
            }
            self.abandon(executor_id).await;
            self.inner.backend.release_executor(&handle).await;
            return Err(MinerError::Provisioning(
                "node is shutting down".to_string(),
            ));
        };

        tokio::spawn(self.clone().watch_executor(handle.clone(), deadline, cancel));

        tracing::info!(
            executor_id = %executor_id,
            executor_class = %handle.executor_class,
            port = handle.port,
            runtime = %handle.runtime,
            backend = self.inner.backend.name(),
            "Executor running"
        );
        Ok(handle)
    }

    /// Terminate an executor. Killing an exited or unknown executor is a
    /// no-op, so racing kills are harmless.
    ///
    /// # Errors
    ///
    /// [`MinerError::Termination`] when the backend could not stop the
    /// worker. The executor is marked `Failed` and its port released anyway.
    pub async fn kill(&self, handle: &ExecutorHandle) -> Result<()> {
        self.terminate(handle, ExitOutcome::Killed).await
    }

    /// Wait up to `timeout` for an executor to exit. Returns within
    /// `timeout` plus a small fixed overhead whatever the backend does.
    pub async fn wait(&self, handle: &ExecutorHandle, timeout: Duration) -> WaitOutcome {
        if let Some(outcome) = handle.state().outcome() {
            return WaitOutcome::exited(outcome);
        }

        let mut state_rx = handle.state_receiver();
        let backend_wait = tokio::time::timeout(
            timeout.saturating_add(WAIT_SLACK),
            self.inner.backend.wait_for_executor(handle, timeout),
        );

        tokio::select! {
            // Finalized elsewhere: kill, reaper or another waiter
            Some(state) = terminal_state(&mut state_rx) => {
                WaitOutcome::exited(state.outcome().unwrap_or(ExitOutcome::Vanished))
            }
            waited = backend_wait => match waited {
                Ok(WaitOutcome::Exited { outcome }) => {
                    if handle.state() == ExecutorState::Terminating {
                        // The terminating task records the cause (Killed or TimedOut)
                        let _ = tokio::time::timeout(WAIT_SLACK, terminal_state(&mut state_rx)).await;
                    } else {
                        self.finalize(handle.id, outcome).await;
                    }
                    // First writer wins; report what was recorded
                    WaitOutcome::exited(handle.state().outcome().unwrap_or(outcome))
                }
                Ok(WaitOutcome::StillRunning) | Err(_) => match handle.state().outcome() {
                    Some(outcome) => WaitOutcome::exited(outcome),
                    None => WaitOutcome::StillRunning,
                },
            },
        }
    }

    /// Remaining capacity per class: what the backend declares minus active
    /// executors, clamped to `0..=declared`.
    pub async fn manifest(&self) -> Manifest {
        let declared = self.declared_manifest().await;
        let active = self.active_counts().await;
        declared.net_of(&active)
    }

    /// Resolve the address peers use to reach an executor.
    ///
    /// # Errors
    ///
    /// [`MinerError::AddressUnavailable`] while the backend has not assigned
    /// one yet, [`MinerError::UnknownExecutor`] for executors not tracked.
    pub async fn executor_address(&self, id: ExecutorId) -> Result<SocketAddr> {
        let handle = self.get(id).await.ok_or(MinerError::UnknownExecutor(id))?;
        if handle.state() != ExecutorState::Running {
            return Err(MinerError::AddressUnavailable(id));
        }

        match tokio::time::timeout(
            ADDRESS_PROBE_TIMEOUT,
            self.inner.backend.get_executor_public_address(&handle),
        )
        .await
        {
            Ok(Some(addr)) => Ok(addr),
            Ok(None) | Err(_) => Err(MinerError::AddressUnavailable(id)),
        }
    }

    /// Poll [`LifecycleSupervisor::executor_address`] with backoff until it
    /// resolves or `timeout` elapses.
    pub async fn await_address(&self, id: ExecutorId, timeout: Duration) -> Result<SocketAddr> {
        let deadline = deadline_after(timeout);
        let mut attempt = 0;
        loop {
            match self.executor_address(id).await {
                Ok(addr) => return Ok(addr),
                Err(MinerError::AddressUnavailable(_)) => {}
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(MinerError::AddressUnavailable(id));
            }
            let delay = self.inner.config.address_backoff.next(attempt);
            attempt = attempt.saturating_add(1);
            tokio::time::sleep(delay.min(deadline - now)).await;
        }
    }

    pub async fn get(&self, id: ExecutorId) -> Option<ExecutorHandle> {
        self.inner
            .registry
            .read()
            .await
            .get(&id)
            .and_then(|t| t.handle.clone())
    }

    /// Handles of every started, not yet deregistered executor.
    pub async fn executors(&self) -> Vec<ExecutorHandle> {
        let registry = self.inner.registry.read().await;
        let mut handles: Vec<ExecutorHandle> =
            registry.values().filter_map(|t| t.handle.clone()).collect();
        handles.sort_by_key(|h| h.started_at);
        handles
    }

    /// Number of executors holding capacity, starting ones included.
    pub async fn active(&self) -> usize {
        self.inner.registry.read().await.len()
    }

    /// Finalize executors the backend reports as exited and terminate those
    /// past their deadline. Returns how many were deregistered.
    pub async fn reap_once(&self) -> usize {
        let tracked: Vec<(ExecutorHandle, Instant)> = {
            let registry = self.inner.registry.read().await;
            registry
                .values()
                .filter_map(|t| t.handle.clone().map(|h| (h, t.deadline)))
                .collect()
        };

        let mut probes = JoinSet::new();
        for (handle, deadline) in tracked {
            let backend = self.inner.backend.clone();
            probes.spawn(async move {
                let waited = tokio::time::timeout(
                    REAP_PROBE_TIMEOUT + WAIT_SLACK,
                    backend.wait_for_executor(&handle, REAP_PROBE_TIMEOUT),
                )
                .await
                .unwrap_or(WaitOutcome::StillRunning);
                (handle, deadline, waited)
            });
        }

        let now = Instant::now();
        let overdue_after = self.inner.config.kill_grace;
        let mut reaped = 0;
        while let Some(joined) = probes.join_next().await {
            let Ok((handle, deadline, waited)) = joined else {
                continue;
            };
            match waited {
                WaitOutcome::Exited { .. } if handle.state() == ExecutorState::Terminating => {}
                WaitOutcome::Exited { outcome } => {
                    if self.finalize(handle.id, outcome).await {
                        reaped += 1;
                    }
                }
                WaitOutcome::StillRunning
                    if handle.state() == ExecutorState::Running
                        && deadline.checked_add(overdue_after).is_some_and(|t| now >= t) =>
                {
                    tracing::warn!(executor_id = %handle.id, "Reaper terminating overdue executor");
                    let _ = self.terminate(&handle, ExitOutcome::TimedOut).await;
                    reaped += 1;
                }
                WaitOutcome::StillRunning => {}
            }
        }
        reaped
    }

    /// Run [`LifecycleSupervisor::reap_once`] every reap interval until
    /// `shutdown` is cancelled.
    pub async fn run_reaper(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.inner.config.reap_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let reaped = self.reap_once().await;
                    if reaped > 0 {
                        tracing::debug!(reaped, "Reaped executors");
                    }
                }
            }
        }
    }

    /// Reclaim workers a previous run of this node left behind.
    ///
    /// Nothing survives a restart in memory, so the backend's runtime
    /// inventory is the only record of them. Orphans that cannot be
    /// reclaimed keep their port quarantined.
    pub async fn reconcile(&self) -> ReconcileReport {
        let orphans = self.inner.backend.inventory().await;
        let known: HashSet<ExecutorId> =
            self.inner.registry.read().await.keys().copied().collect();

        let mut report = ReconcileReport::default();
        for orphan in orphans {
            if orphan.executor_id.is_some_and(|id| known.contains(&id)) {
                continue;
            }
            match self.inner.backend.reclaim_orphan(&orphan).await {
                Ok(()) => {
                    tracing::info!(runtime = %orphan.runtime, port = ?orphan.port, "Reclaimed orphaned executor");
                    report.reclaimed += 1;
                }
                Err(e) => {
                    tracing::warn!(runtime = %orphan.runtime, error = %e, "Failed to reclaim orphaned executor");
                    report.failed += 1;
                    if let Some(port) = orphan.port {
                        if self.inner.ports.quarantine(port) {
                            report.quarantined_ports.push(port);
                        }
                    }
                }
            }
        }
        report
    }

    /// Refuse new starts and terminate every live executor.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let handles = self.executors().await;
        tracing::info!(executors = handles.len(), "Terminating executors for shutdown");

        let mut kills = JoinSet::new();
        for handle in handles {
            let supervisor = self.clone();
            kills.spawn(async move {
                if let Err(e) = supervisor.kill(&handle).await {
                    tracing::warn!(executor_id = %handle.id, error = %e, "Failed to terminate executor on shutdown");
                }
            });
        }
        while kills.join_next().await.is_some() {}
    }

    async fn terminate(&self, handle: &ExecutorHandle, cause: ExitOutcome) -> Result<()> {
        {
            let registry = self.inner.registry.read().await;
            match registry.get(&handle.id) {
                Some(tracked) => {
                    tracked.transition(ExecutorState::Terminating);
                }
                None => return Ok(()),
            }
        }

        match self.inner.backend.kill_executor(handle).await {
            Ok(()) => {
                let waited = tokio::time::timeout(
                    KILL_REAP_TIMEOUT + WAIT_SLACK,
                    self.inner
                        .backend
                        .wait_for_executor(handle, KILL_REAP_TIMEOUT),
                )
                .await
                .unwrap_or(WaitOutcome::StillRunning);
                let outcome = match waited {
                    // Exited on its own just before the kill landed
                    WaitOutcome::Exited {
                        outcome: outcome @ ExitOutcome::Completed { .. },
                    } => outcome,
                    _ => cause,
                };
                self.finalize(handle.id, outcome).await;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    executor_id = %handle.id,
                    port = handle.port,
                    error = %e,
                    "Executor did not terminate, marking failed and releasing its port"
                );
                self.finalize(handle.id, ExitOutcome::TerminationFailed)
                    .await;
                Err(e)
            }
        }
    }

    /// Deregister an executor and release its port. Only the first call per
    /// executor has an effect; returns whether this call was it.
    async fn finalize(&self, id: ExecutorId, outcome: ExitOutcome) -> bool {
        let tracked = {
            let mut registry = self.inner.registry.write().await;
            let Some(tracked) = registry.remove(&id) else {
                return false;
            };
            self.inner.ports.release(tracked.request.port);
            tracked.transition(ExecutorState::terminal(outcome));
            tracked
        };
        tracked.cancel.cancel();

        tracing::info!(
            executor_id = %id,
            executor_class = %tracked.request.executor_class,
            port = tracked.request.port,
            outcome = %outcome,
            "Executor deregistered"
        );

        if let Some(handle) = tracked.handle {
            let backend = self.inner.backend.clone();
            tokio::spawn(async move { backend.release_executor(&handle).await });
        }
        true
    }

    /// Drop a registration whose worker never started.
    async fn abandon(&self, id: ExecutorId) {
        let mut registry = self.inner.registry.write().await;
        if let Some(tracked) = registry.remove(&id) {
            self.inner.ports.release(tracked.request.port);
            tracked.transition(ExecutorState::terminal(ExitOutcome::Vanished));
            tracked.cancel.cancel();
        }
    }

    /// Wait for an executor until its deadline, then terminate it.
    async fn watch_executor(
        self,
        handle: ExecutorHandle,
        deadline: Instant,
        cancel: CancellationToken,
    ) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let waited = tokio::select! {
            _ = cancel.cancelled() => return,
            waited = self.wait(&handle, remaining) => waited,
        };

        if waited == WaitOutcome::StillRunning && !cancel.is_cancelled() {
            tracing::warn!(executor_id = %handle.id, "Executor outlived its deadline, terminating");
            if let Err(e) = self.terminate(&handle, ExitOutcome::TimedOut).await {
                tracing::warn!(executor_id = %handle.id, error = %e, "Failed to terminate overdue executor");
            }
        }
    }

    async fn declared_manifest(&self) -> Manifest {
        let reported =
            tokio::time::timeout(
            self.inner.config.manifest_timeout,
            self.inner.backend.get_manifest(),
        )
        .await;
        let mut last = self
            .inner
            .last_declared
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match reported {
            Ok(manifest) => {
                *last = manifest.clone();
                manifest
            }
            Err(_) => {
                tracing::warn!("Backend manifest query timed out, reporting zero capacity");
                last.zeroed()
            }
        }
    }

    async fn active_counts(&self) -> BTreeMap<ExecutorClass, u32> {
        let registry = self.inner.registry.read().await;
        let mut counts = BTreeMap::new();
        for tracked in registry.values() {
            *counts
                .entry(tracked.request.executor_class.clone())
                .or_insert(0) += 1;
        }
        counts
    }
}

async fn terminal_state(rx: &mut watch::Receiver<ExecutorState>) -> Option<ExecutorState> {
    rx.wait_for(ExecutorState::is_terminal)
        .await
        .ok()
        .map(|state| *state)
}

/// `timeout` from now, saturating far in the future instead of overflowing.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or(now + FAR_FUTURE)
}
