pub mod scheduler;

pub use hwsched_core::{Config, DependencyKey, Lane, OwnerId, Priority, SchedulerConfig};
pub use scheduler::{
    EntryPoint, Lookup, SchedError, Scheduler, SchedulerMetrics, SchedulerState, SyncHandle,
    TaskDescriptor, TaskError, TaskResult, TaskState, TaskStatus,
};
