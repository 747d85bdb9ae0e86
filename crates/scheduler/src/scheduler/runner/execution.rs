use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use hwsched_core::OwnerId;
use tracing::{debug, warn};

use crate::scheduler::task::{EntryPoint, TaskError, TaskResult, TaskStatus};
use crate::scheduler::types::{SyncHandle, TaskState};

use super::core::{lock_unpoisoned, wait_timeout_unpoisoned, Core, Inner};
use super::scheduling::Dispatch;

/// A completion hook owed to a task that finished without running it.
pub(super) struct PendingHook {
    handle: SyncHandle,
    entry: Arc<dyn EntryPoint>,
    result: TaskResult,
}

/// Outcome of driving one task (and its poisoned dependents) to a terminal
/// state under the core lock.
#[derive(Default)]
pub(super) struct Finished {
    /// Tasks that reached a terminal state, root included.
    pub(super) finished: usize,
    /// Dependents failed without running.
    pub(super) poisoned: usize,
    /// Completion hooks still to run, outside the lock.
    pub(super) hooks: Vec<PendingHook>,
}

/// What a single call asked for next.
enum Ran {
    Continue(SyncHandle),
    Busy(SyncHandle),
    Done,
}

/// Marks the scheduler failed if a worker unwinds out of its loop.
struct WorkerGuard<'a> {
    inner: &'a Inner,
    index: usize,
}

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.inner.worker_died.store(true, Ordering::Release);
            tracing::error!(worker = self.index, "worker thread died");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Inner {
    /// Body of worker thread `index`. Returns once the scheduler shuts down.
    pub(super) fn worker_loop(&self, index: usize) {
        let _guard = WorkerGuard { inner: self, index };
        debug!(worker = index, dedicated = self.is_dedicated(index), "worker started");

        let mut previous: Option<SyncHandle> = None;
        let mut core = self.lock_core();
        loop {
            if core.shut_down {
                break;
            }

            match self.select(&mut core, index, previous.take()) {
                Some(dispatch) => {
                    drop(core);
                    let ran = self.run(index, dispatch);
                    core = self.lock_core();
                    // Requeue under the same lock the next selection uses,
                    // so a continuing task can't be taken by another worker.
                    previous = match ran {
                        Ran::Continue(handle) => self.requeue(&mut core, handle, false),
                        Ran::Busy(handle) => self.requeue(&mut core, handle, true),
                        Ran::Done => None,
                    };
                }
                None => {
                    let timeout = if self.has_busy_work(&core, index) {
                        self.config.busy_retry()
                    } else {
                        self.config.idle_wait()
                    };
                    core.workers[index].waiting = true;
                    core = wait_timeout_unpoisoned(&self.worker_wake[index], core, timeout);
                    core.workers[index].waiting = false;
                }
            }
        }

        debug!(worker = index, "worker stopped");
    }

    /// Call the entry point once. Terminal statuses are applied here;
    /// `Continue` and `Busy` are handed back to the loop for requeueing.
    fn run(&self, index: usize, dispatch: Dispatch) -> Ran {
        let Dispatch {
            handle,
            entry,
            name,
            priority,
            call_number,
        } = dispatch;

        debug!(
            worker = index,
            task_id = handle.task_id,
            job_id = handle.job_id,
            %priority,
            call = call_number,
            task = %name,
            "dispatch"
        );

        self.active_workers.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| entry.call(index, call_number)));
        let elapsed = started.elapsed();
        self.active_workers.fetch_sub(1, Ordering::Relaxed);

        lock_unpoisoned(&self.fairness).record(priority, elapsed);
        self.metrics_mut().record_call(&name, elapsed);

        let result: TaskResult = match outcome {
            Ok(TaskStatus::Continue) => return Ran::Continue(handle),
            Ok(TaskStatus::Busy) => return Ran::Busy(handle),
            Ok(TaskStatus::Done) => Ok(()),
            Ok(TaskStatus::Failed(code)) => Err(TaskError::Failed(code)),
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                warn!(task = %name, %handle, panic = %msg, "entry point panicked");
                self.metrics_mut().tasks_panicked += 1;
                Err(TaskError::Panicked(msg))
            }
        };

        let result = run_completion_hook(entry.as_ref(), result);
        match &result {
            Ok(()) => debug!(task = %name, %handle, ?elapsed, "task completed"),
            Err(e) => warn!(task = %name, %handle, error = %e, "task failed"),
        }

        self.metrics_mut().record_execution(&name, result.is_ok());

        let done = {
            let mut core = self.lock_core();
            self.finish_task(&mut core, handle, result, false)
        };
        self.metrics_mut().tasks_poisoned += done.poisoned as u64;
        self.run_completion_hooks(done.hooks);
        Ran::Done
    }

    /// Put a task that returned `Continue` or `Busy` back in its queue.
    /// Returns the handle when it should be continued by this worker.
    fn requeue(&self, core: &mut Core, handle: SyncHandle, busy: bool) -> Option<SyncHandle> {
        let slot = core.pool.get_mut(handle)?;
        if slot.state != TaskState::Running {
            return None;
        }
        slot.state = TaskState::Ready;
        slot.calls = slot.calls.wrapping_add(1);
        slot.waiting = busy;
        let (priority, lane, owner) = (slot.priority, slot.lane, slot.owner);

        if busy {
            // Skipped until a hardware event arrives or the retry period runs out.
            core.queues.push_back(priority, lane, handle);
            core.park(owner, handle);
            None
        } else {
            core.queues.push_front(priority, lane, handle);
            Some(handle)
        }
    }

    /// Drive `handle` to a terminal state with `result`, then resolve its
    /// outputs. Consumers whose last input arrived become Ready; on failure
    /// every blocked dependent is failed in turn without running, using a
    /// worklist instead of recursion.
    ///
    /// With `run_root_hook` unset the caller has already run the root's
    /// completion hook.
    pub(super) fn finish_task(
        &self,
        core: &mut Core,
        handle: SyncHandle,
        result: TaskResult,
        run_root_hook: bool,
    ) -> Finished {
        let mut done = Finished::default();
        let mut worklist = vec![(handle, result)];

        while let Some((current, result)) = worklist.pop() {
            let Some(slot) = core.pool.get_mut(current) else {
                continue;
            };
            slot.state = if result.is_ok() {
                TaskState::Succeeded
            } else {
                TaskState::Failed
            };
            slot.result = Some(result.clone());
            slot.waiting = false;
            let outputs = std::mem::take(&mut slot.outputs);
            let owner = slot.owner;
            let hook = slot
                .entry
                .take()
                .filter(|_| current != handle || run_root_hook);
            // Waiters see the task as done only after its hook ran.
            slot.hook_pending = hook.is_some();
            slot.done.notify_all();
            done.finished += 1;

            if let Some(entry) = hook {
                done.hooks.push(PendingHook {
                    handle: current,
                    entry,
                    result: result.clone(),
                });
            }
            if current != handle {
                done.poisoned += 1;
            }

            for key in outputs {
                let consumers = core.deps.resolve(current, key, &result);
                for consumer in consumers {
                    let Some(slot) = core.pool.get_mut(consumer) else {
                        continue;
                    };
                    if slot.state != TaskState::Blocked {
                        continue;
                    }
                    match &result {
                        Ok(()) => {
                            slot.pending_inputs = slot.pending_inputs.saturating_sub(1);
                            if slot.pending_inputs == 0 {
                                slot.state = TaskState::Ready;
                                let (priority, lane) = (slot.priority, slot.lane);
                                core.queues.push_back(priority, lane, consumer);
                                self.wake_for_lane(core, lane);
                            }
                        }
                        Err(_) => {
                            // Marked now so a second failed input can't queue it twice.
                            slot.state = TaskState::Failed;
                            worklist.push((consumer, Err(TaskError::AbortedByDependency { key })));
                        }
                    }
                }
            }

            if let Some(owner) = owner {
                self.reset_owner_waiting(core, owner);
            }
        }

        self.task_done.notify_all();
        done
    }

    /// Run hooks collected by [`finish_task`](Self::finish_task) and
    /// release their waiters. Must be called without the core lock.
    pub(super) fn run_completion_hooks(&self, hooks: Vec<PendingHook>) {
        if hooks.is_empty() {
            return;
        }
        for hook in &hooks {
            // Already failed; a hook error can't make it worse.
            let _ = run_completion_hook(hook.entry.as_ref(), hook.result.clone());
        }

        let mut core = self.lock_core();
        for hook in &hooks {
            if let Some(slot) = core.pool.get_mut(hook.handle) {
                slot.hook_pending = false;
                slot.done.notify_all();
            }
        }
        drop(core);
        self.task_done.notify_all();
    }

    /// Clear the `Busy` parking of `owner`'s queued tasks. Returns how many
    /// were cleared. Touches only that owner's parked set.
    pub(super) fn reset_owner_waiting(&self, core: &mut Core, owner: OwnerId) -> usize {
        let Some(parked) = core.parked.remove(&owner) else {
            return 0;
        };
        let mut cleared = 0;
        for handle in parked {
            if let Some(slot) = core.pool.get_mut(handle) {
                if slot.waiting && slot.state == TaskState::Ready {
                    slot.waiting = false;
                    cleared += 1;
                }
            }
        }
        cleared
    }
}

/// Run the completion hook under `catch_unwind`. A hook error or panic
/// fails an otherwise successful task; an earlier failure is kept.
fn run_completion_hook(entry: &dyn EntryPoint, result: TaskResult) -> TaskResult {
    let hook = panic::catch_unwind(AssertUnwindSafe(|| entry.complete(&result)));
    let hook = match hook {
        Ok(r) => r,
        Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
    };
    match (result, hook) {
        (Ok(()), Err(e)) => Err(e),
        (result, _) => result,
    }
}
