use std::time::Instant;

use tracing::debug;

use crate::scheduler::dependency::InputLink;
use crate::scheduler::task::{SchedError, TaskDescriptor, TaskError};
use crate::scheduler::types::{SyncHandle, TaskState};

use super::Scheduler;

impl Scheduler {
    /// Queue a task and return the handle to wait on.
    ///
    /// The task becomes Ready at once if every input is resolved, Blocked
    /// otherwise. If an input's producer already failed, the task is failed
    /// with [`TaskError::AbortedByDependency`] without running, its outputs
    /// are failed in turn, and the handle is still returned so the caller
    /// can observe the failure through [`synchronize`](Self::synchronize).
    pub fn submit(&self, mut task: TaskDescriptor) -> Result<SyncHandle, SchedError> {
        task.validate(self.inner.config.max_task_dependencies)?;

        let mut core = self.inner.lock_core();
        if core.shut_down {
            return Err(SchedError::ShutDown);
        }
        core.deps.check_outputs(&task.outputs)?;
        let handle = core.pool.acquire()?;

        let mut pending = 0;
        let mut poisoned: Option<TaskError> = None;
        for key in &task.inputs {
            match core.deps.link_input(handle, *key) {
                InputLink::Pending => pending += 1,
                InputLink::Satisfied => {}
                InputLink::Poisoned(err) => {
                    debug!(%handle, %key, error = %err, "input already failed");
                    poisoned.get_or_insert(TaskError::AbortedByDependency { key: *key });
                }
            }
        }
        if poisoned.is_some() {
            for key in &task.inputs {
                core.deps.unlink_input(handle, *key);
            }
        }
        core.deps.register_outputs(handle, &task.outputs);

        let name = task.entry.name().to_string();
        let (priority, lane, owner) = (task.priority, task.lane, task.owner);
        if let Some(slot) = core.pool.get_mut(handle) {
            slot.entry = Some(task.entry);
            slot.name.clone_from(&name);
            slot.priority = priority;
            slot.lane = lane;
            slot.owner = owner;
            slot.outputs = task.outputs;
            slot.pending_inputs = pending;
            slot.submitted_at = Some(Instant::now());
            slot.state = if poisoned.is_some() || pending > 0 {
                TaskState::Blocked
            } else {
                TaskState::Ready
            };
        }

        // New work from an owner may be what its parked tasks wait on.
        if let Some(owner) = owner {
            self.inner.reset_owner_waiting(&mut core, owner);
        }

        debug!(
            task_id = handle.task_id,
            job_id = handle.job_id,
            %priority,
            %lane,
            task = %name,
            inputs = task.inputs.len(),
            pending,
            "task submitted"
        );

        if let Some(err) = poisoned {
            let done = self.inner.finish_task(&mut core, handle, Err(err), true);
            drop(core);
            {
                let mut m = self.inner.metrics_mut();
                m.tasks_submitted += 1;
                m.tasks_poisoned += done.finished as u64;
            }
            self.inner.run_completion_hooks(done.hooks);
            return Ok(handle);
        }

        if pending == 0 {
            core.queues.push_back(priority, lane, handle);
            self.inner.wake_for_lane(&mut core, lane);
        }
        drop(core);

        self.inner.metrics_mut().tasks_submitted += 1;
        Ok(handle)
    }
}
