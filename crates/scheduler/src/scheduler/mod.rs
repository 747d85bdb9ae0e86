//! Dependency-aware, multi-priority task scheduler.
//!
//! Codec components (decode, encode, VPP) describe asynchronous work as a
//! [`TaskDescriptor`]: an [`EntryPoint`], a priority class, a lane, an owner,
//! and the dependency keys it consumes and produces. [`Scheduler::submit`]
//! returns a [`SyncHandle`] that any thread can block on.
//!
//! Internally a bounded slot pool holds descriptors, a dependency table maps
//! each produced key to its producer, and one FIFO ready queue exists per
//! (priority, lane) pair. A fixed pool of worker threads drains the queues,
//! biased by a rolling fairness window, and a separate wake-up thread turns
//! hardware completion events into worker wake-ups. A failed producer
//! poisons its whole downstream subtree without running it.

pub mod dependency;
pub(crate) mod fairness;
pub mod metrics;
pub(crate) mod pool;
pub(crate) mod queues;
pub mod runner;
pub mod task;
pub mod types;

pub use dependency::{DependencyStats, Lookup};
pub use metrics::SchedulerMetrics;
pub use runner::Scheduler;
pub use task::{EntryPoint, SchedError, TaskDescriptor, TaskError, TaskResult, TaskStatus};
pub use types::{SchedulerState, SyncHandle, TaskState};
