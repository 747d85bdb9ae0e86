use serde::{Deserialize, Serialize};

/// Externally visible handle of a submitted task.
///
/// `task_id` names the descriptor slot; `job_id` is a global, never-zero
/// submission counter. A slot recycled for a new job gets a new `job_id`, so
/// handles from an earlier job never match it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncHandle {
    pub task_id: u32,
    pub job_id: u32,
}

impl SyncHandle {
    pub const fn new(task_id: u32, job_id: u32) -> Self {
        Self { task_id, job_id }
    }

    /// Pack into a single word (`task_id` in the low half).
    pub fn to_raw(self) -> u64 {
        (u64::from(self.job_id) << 32) | u64::from(self.task_id)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self {
            task_id: raw as u32,
            job_id: (raw >> 32) as u32,
        }
    }
}

impl std::fmt::Display for SyncHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.task_id, self.job_id)
    }
}

/// Lifecycle of a task descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Owned by the pool, not holding a task.
    Free,
    /// Queued, waiting for at least one input to resolve.
    Blocked,
    /// Queued with every input resolved.
    Ready,
    /// Claimed by exactly one worker.
    Running,
    /// Done, entry point reported success.
    Succeeded,
    /// Done with a failure (own, panic, poisoned input, or shutdown).
    Failed,
}

impl TaskState {
    /// Blocked, Ready or Running.
    pub fn is_live(self) -> bool {
        matches!(self, TaskState::Blocked | TaskState::Ready | TaskState::Running)
    }

    pub fn is_done(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

/// Coarse scheduler health, readable by the owning session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerState {
    /// Accepting and running work.
    Running,
    /// Shut down, or a worker thread died.
    Failed,
    /// Failed results are retained in the dependency table; call `reset()`.
    ResetNeeded,
}
