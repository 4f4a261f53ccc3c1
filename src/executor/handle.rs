use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use super::class::ExecutorClass;

const TOKEN_LEN: usize = 32;

/// Opaque identifier of one provisioned executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutorId(Uuid);

impl ExecutorId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ExecutorId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ExecutorId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl From<Uuid> for ExecutorId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Single-use credential handed to an executor at launch so it can
/// authenticate its callback to the coordinator.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutorToken(String);

impl ExecutorToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Mint a random token for callers that do not bring their own.
    pub fn generate() -> Self {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect();
        Self(token)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ExecutorToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ExecutorToken(***)")
    }
}

/// Backend-specific reference to the running worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuntimeRef {
    Process { pid: u32 },
    Container { name: String },
}

impl std::fmt::Display for RuntimeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeRef::Process { pid } => write!(f, "pid:{}", pid),
            RuntimeRef::Container { name } => write!(f, "container:{}", name),
        }
    }
}

/// How an executor ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitOutcome {
    /// The worker exited on its own.
    Completed { code: i32 },
    /// The worker was terminated by a signal nobody here sent.
    Signalled { signal: i32 },
    /// Terminated by an explicit kill.
    Killed,
    /// Terminated because it outlived its deadline.
    TimedOut,
    /// A kill did not take effect within the grace period.
    TerminationFailed,
    /// The backend no longer knows about the worker.
    Vanished,
}

impl ExitOutcome {
    /// Clean outcomes end in `Exited`, everything else in `Failed`.
    pub fn is_clean(&self) -> bool {
        matches!(
            self,
            ExitOutcome::Completed { code: 0 } | ExitOutcome::Killed | ExitOutcome::TimedOut
        )
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitOutcome::Completed { code } => write!(f, "exited with code {}", code),
            ExitOutcome::Signalled { signal } => write!(f, "terminated by signal {}", signal),
            ExitOutcome::Killed => write!(f, "killed"),
            ExitOutcome::TimedOut => write!(f, "timed out"),
            ExitOutcome::TerminationFailed => write!(f, "termination failed"),
            ExitOutcome::Vanished => write!(f, "vanished"),
        }
    }
}

/// Result of a bounded wait on an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WaitOutcome {
    Exited { outcome: ExitOutcome },
    StillRunning,
}

impl WaitOutcome {
    pub fn exited(outcome: ExitOutcome) -> Self {
        WaitOutcome::Exited { outcome }
    }

    pub fn outcome(&self) -> Option<ExitOutcome> {
        match self {
            WaitOutcome::Exited { outcome } => Some(*outcome),
            WaitOutcome::StillRunning => None,
        }
    }
}

/// Lifecycle state of one executor.
///
/// `Starting → Running → {Exited | Failed}` and `Running → Terminating → Exited`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExecutorState {
    Starting,
    Running,
    Terminating,
    Exited { outcome: ExitOutcome },
    Failed { outcome: ExitOutcome },
}

impl ExecutorState {
    /// Terminal state for an outcome.
    pub fn terminal(outcome: ExitOutcome) -> Self {
        if outcome.is_clean() {
            ExecutorState::Exited { outcome }
        } else {
            ExecutorState::Failed { outcome }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutorState::Exited { .. } | ExecutorState::Failed { .. }
        )
    }

    /// Starting, running and terminating executors all hold capacity.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn outcome(&self) -> Option<ExitOutcome> {
        match self {
            ExecutorState::Exited { outcome } | ExecutorState::Failed { outcome } => {
                Some(*outcome)
            }
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            ExecutorState::Starting => 0,
            ExecutorState::Running => 1,
            ExecutorState::Terminating => 2,
            ExecutorState::Exited { .. } | ExecutorState::Failed { .. } => 3,
        }
    }

    /// Transitions only move forward; no state is revisited.
    pub fn can_transition_to(&self, next: &ExecutorState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            // A worker can only be asked to terminate once it runs
            (ExecutorState::Starting, ExecutorState::Terminating) => false,
            _ => next.rank() > self.rank(),
        }
    }
}

impl std::fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorState::Starting => write!(f, "starting"),
            ExecutorState::Running => write!(f, "running"),
            ExecutorState::Terminating => write!(f, "terminating"),
            ExecutorState::Exited { .. } => write!(f, "exited"),
            ExecutorState::Failed { .. } => write!(f, "failed"),
        }
    }
}

/// Everything a backend needs to launch one executor.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub executor_id: ExecutorId,
    pub token: ExecutorToken,
    pub executor_class: ExecutorClass,
    pub port: u16,
    /// Address the executor calls back to.
    pub coordinator_addr: String,
}

/// Worker found in a backend's runtime inventory that no handle owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanExecutor {
    pub runtime: RuntimeRef,
    pub executor_id: Option<ExecutorId>,
    pub executor_class: Option<ExecutorClass>,
    pub port: Option<u16>,
}

/// Reference to one provisioned executor.
///
/// Cheap to clone; every clone observes the same live state.
#[derive(Debug, Clone)]
pub struct ExecutorHandle {
    pub id: ExecutorId,
    pub executor_class: ExecutorClass,
    pub port: u16,
    pub token: ExecutorToken,
    pub runtime: RuntimeRef,
    pub started_at: DateTime<Utc>,
    state: watch::Receiver<ExecutorState>,
}

impl ExecutorHandle {
    pub fn new(
        request: &LaunchRequest,
        runtime: RuntimeRef,
        state: watch::Receiver<ExecutorState>,
    ) -> Self {
        Self {
            id: request.executor_id,
            executor_class: request.executor_class.clone(),
            port: request.port,
            token: request.token.clone(),
            runtime,
            started_at: Utc::now(),
            state,
        }
    }

    /// A handle nobody supervises. Its state stays `Running`; useful when
    /// driving a backend directly.
    pub fn detached(request: &LaunchRequest, runtime: RuntimeRef) -> Self {
        let (_tx, rx) = watch::channel(ExecutorState::Running);
        Self::new(request, runtime, rx)
    }

    pub fn state(&self) -> ExecutorState {
        *self.state.borrow()
    }

    pub(crate) fn state_receiver(&self) -> watch::Receiver<ExecutorState> {
        self.state.clone()
    }
}

/// Serializable view of a handle for APIs and logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub id: ExecutorId,
    pub executor_class: ExecutorClass,
    pub port: u16,
    pub runtime: RuntimeRef,
    pub state: ExecutorState,
    pub started_at: DateTime<Utc>,
    pub public_addr: Option<SocketAddr>,
}

impl From<&ExecutorHandle> for ExecutorInfo {
    fn from(handle: &ExecutorHandle) -> Self {
        Self {
            id: handle.id,
            executor_class: handle.executor_class.clone(),
            port: handle.port,
            runtime: handle.runtime.clone(),
            state: handle.state(),
            started_at: handle.started_at,
            public_addr: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_monotonic() {
        let exited = ExecutorState::terminal(ExitOutcome::Killed);

        assert!(ExecutorState::Starting.can_transition_to(&ExecutorState::Running));
        assert!(ExecutorState::Running.can_transition_to(&ExecutorState::Terminating));
        assert!(ExecutorState::Terminating.can_transition_to(&exited));
        assert!(ExecutorState::Starting.can_transition_to(&exited));

        assert!(!ExecutorState::Running.can_transition_to(&ExecutorState::Starting));
        assert!(!ExecutorState::Terminating.can_transition_to(&ExecutorState::Running));
        assert!(!ExecutorState::Starting.can_transition_to(&ExecutorState::Terminating));
        assert!(!exited.can_transition_to(&ExecutorState::Running));
        assert!(!exited.can_transition_to(&ExecutorState::terminal(ExitOutcome::Vanished)));
    }

    #[test]
    fn terminal_state_depends_on_outcome() {
        assert!(matches!(
            ExecutorState::terminal(ExitOutcome::Completed { code: 0 }),
            ExecutorState::Exited { .. }
        ));
        assert!(matches!(
            ExecutorState::terminal(ExitOutcome::Killed),
            ExecutorState::Exited { .. }
        ));
        assert!(matches!(
            ExecutorState::terminal(ExitOutcome::Completed { code: 3 }),
            ExecutorState::Failed { .. }
        ));
        assert!(matches!(
            ExecutorState::terminal(ExitOutcome::TerminationFailed),
            ExecutorState::Failed { .. }
        ));
    }

    #[test]
    fn token_debug_is_redacted() {
        let token = ExecutorToken::new("super-secret");
        assert_eq!(format!("{:?}", token), "ExecutorToken(***)");
        assert_eq!(token.expose(), "super-secret");
    }

    #[test]
    fn generated_tokens_differ() {
        let a = ExecutorToken::generate();
        let b = ExecutorToken::generate();
        assert_eq!(a.expose().len(), TOKEN_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn executor_id_round_trips_through_string() {
        let id = ExecutorId::new();
        let parsed: ExecutorId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }
}
