use std::sync::Arc;
use std::time::Duration;

use hwsched_core::{ConfigError, DependencyKey, Lane, OwnerId, Priority};

use super::types::SyncHandle;

/// What an entry point reports after one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// The task is finished.
    Done,
    /// More work remains; call again (same worker when possible).
    Continue,
    /// Waiting on hardware; retry after a hardware event or a short delay.
    Busy,
    /// The task's own logic failed with a component-defined code.
    Failed(i32),
}

/// Terminal failure of a task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("task failed with code {0}")]
    Failed(i32),
    #[error("entry point panicked: {0}")]
    Panicked(String),
    #[error("aborted: input {key} was never produced")]
    AbortedByDependency { key: DependencyKey },
    #[error("aborted by scheduler shutdown")]
    Aborted,
}

pub type TaskResult = Result<(), TaskError>;

/// Errors surfaced by the scheduler API.
#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    #[error("task pool exhausted ({capacity} slots in use)")]
    PoolExhausted { capacity: usize },
    #[error("dependency table full ({capacity} entries)")]
    DependencyTableFull { capacity: usize },
    #[error("dependency {0} already has a pending producer")]
    KeyCollision(DependencyKey),
    #[error("invalid task descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("wait timed out after {0:?}")]
    Timeout(Duration),
    #[error("stale sync handle {0}")]
    StaleHandle(SyncHandle),
    #[error("scheduler is shut down")]
    ShutDown,
    #[error("failed to spawn scheduler thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Task(#[from] TaskError),
}

impl SchedError {
    /// Resource exhaustion is transient; callers back off and resubmit.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SchedError::PoolExhausted { .. } | SchedError::DependencyTableFull { .. })
    }
}

/// A unit of asynchronous work a codec component hands to the scheduler.
///
/// Whatever state and parameters the component needs travel inside the
/// implementor. `call` may be invoked many times for one task when it keeps
/// returning [`TaskStatus::Continue`] or [`TaskStatus::Busy`], but never by
/// two workers at once.
pub trait EntryPoint: Send + Sync {
    /// Human-readable name for logging and metrics.
    fn name(&self) -> &str {
        "async task"
    }

    /// Run one burst of work. `call_number` starts at 0 for each task.
    fn call(&self, worker_index: usize, call_number: u32) -> TaskStatus;

    /// Invoked once the task reaches a terminal state, including when it is
    /// poisoned or aborted without ever running. An error turns a successful
    /// task into a failed one.
    fn complete(&self, _result: &TaskResult) -> TaskResult {
        Ok(())
    }
}

impl<F> EntryPoint for F
where
    F: Fn(usize, u32) -> TaskStatus + Send + Sync,
{
    fn call(&self, worker_index: usize, call_number: u32) -> TaskStatus {
        self(worker_index, call_number)
    }
}

/// Entry point with a caller-chosen name, wrapping a closure.
struct NamedFn<F> {
    name: String,
    f: F,
}

impl<F> EntryPoint for NamedFn<F>
where
    F: Fn(usize, u32) -> TaskStatus + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, worker_index: usize, call_number: u32) -> TaskStatus {
        (self.f)(worker_index, call_number)
    }
}

/// Everything the scheduler needs to queue a task.
pub struct TaskDescriptor {
    pub(crate) entry: Arc<dyn EntryPoint>,
    pub(crate) priority: Priority,
    pub(crate) lane: Lane,
    pub(crate) owner: Option<OwnerId>,
    pub(crate) inputs: Vec<DependencyKey>,
    pub(crate) outputs: Vec<DependencyKey>,
}

impl TaskDescriptor {
    pub fn new(entry: Arc<dyn EntryPoint>) -> Self {
        Self {
            entry,
            priority: Priority::Normal,
            lane: Lane::Software,
            owner: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Descriptor around a named closure.
    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(usize, u32) -> TaskStatus + Send + Sync + 'static,
    {
        Self::new(Arc::new(NamedFn { name: name.into(), f }))
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn lane(mut self, lane: Lane) -> Self {
        self.lane = lane;
        self
    }

    pub fn owner(mut self, owner: OwnerId) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Declare a resource this task must wait for.
    pub fn input(mut self, key: impl Into<DependencyKey>) -> Self {
        self.inputs.push(key.into());
        self
    }

    /// Declare a resource this task makes available when it completes.
    pub fn output(mut self, key: impl Into<DependencyKey>) -> Self {
        self.outputs.push(key.into());
        self
    }

    pub fn inputs(mut self, keys: impl IntoIterator<Item = DependencyKey>) -> Self {
        self.inputs.extend(keys);
        self
    }

    pub fn outputs(mut self, keys: impl IntoIterator<Item = DependencyKey>) -> Self {
        self.outputs.extend(keys);
        self
    }

    pub fn name(&self) -> &str {
        self.entry.name()
    }

    /// Check shape constraints that don't depend on scheduler state.
    /// Duplicate inputs are collapsed.
    pub(crate) fn validate(&mut self, max_dependencies: usize) -> Result<(), SchedError> {
        self.inputs.sort_unstable();
        self.inputs.dedup();

        if self.inputs.len() > max_dependencies {
            return Err(SchedError::InvalidDescriptor(format!(
                "{} inputs exceed the limit of {}",
                self.inputs.len(),
                max_dependencies
            )));
        }
        if self.outputs.len() > max_dependencies {
            return Err(SchedError::InvalidDescriptor(format!(
                "{} outputs exceed the limit of {}",
                self.outputs.len(),
                max_dependencies
            )));
        }

        let mut outputs = self.outputs.clone();
        outputs.sort_unstable();
        if outputs.windows(2).any(|w| w[0] == w[1]) {
            return Err(SchedError::InvalidDescriptor("duplicate output key".into()));
        }
        if let Some(key) = self.inputs.iter().find(|k| outputs.binary_search(*k).is_ok()) {
            return Err(SchedError::InvalidDescriptor(format!(
                "task both consumes and produces {key}"
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for TaskDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("name", &self.entry.name())
            .field("priority", &self.priority)
            .field("lane", &self.lane)
            .field("owner", &self.owner)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}
