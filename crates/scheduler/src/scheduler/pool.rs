//! Bounded pool of reusable task descriptor slots.
//!
//! Slots are addressed by [`SyncHandle`]s: the slot index plus the job id of
//! the submission currently occupying it. Releasing a slot zeroes its job id,
//! and every acquire stamps a fresh one, so a handle from an earlier job can
//! never reach the slot's next occupant.

use std::sync::{Arc, Condvar};
use std::time::Instant;

use hwsched_core::{DependencyKey, Lane, OwnerId, Priority};

use super::task::{EntryPoint, SchedError, TaskResult};
use super::types::{SyncHandle, TaskState};

/// Storage for one task. Everything is guarded by the scheduler's core lock.
pub(crate) struct TaskSlot {
    /// 0 while the slot is free.
    pub(crate) job_id: u32,
    pub(crate) state: TaskState,
    /// Dropped as soon as the task is done so the component can go away.
    pub(crate) entry: Option<Arc<dyn EntryPoint>>,
    pub(crate) name: String,
    pub(crate) priority: Priority,
    pub(crate) lane: Lane,
    pub(crate) owner: Option<OwnerId>,
    pub(crate) outputs: Vec<DependencyKey>,
    /// Inputs whose producer has not resolved yet.
    pub(crate) pending_inputs: usize,
    /// Number of calls issued so far.
    pub(crate) calls: u32,
    /// Set by a `Busy` return; cleared by hw events, owner resets, or retry.
    pub(crate) waiting: bool,
    pub(crate) hw_counter_at_enter: u64,
    pub(crate) last_enter: Option<Instant>,
    pub(crate) submitted_at: Option<Instant>,
    pub(crate) result: Option<TaskResult>,
    /// Terminal, but the completion hook has not run yet.
    pub(crate) hook_pending: bool,
    /// Threads currently blocked in a wait on this job.
    pub(crate) waiters: usize,
    /// A `synchronize` has returned the result; the last waiter out frees
    /// the slot.
    pub(crate) synced: bool,
    /// Signalled when the task reaches a terminal state.
    pub(crate) done: Arc<Condvar>,
}

impl TaskSlot {
    fn vacant() -> Self {
        Self {
            job_id: 0,
            state: TaskState::Free,
            entry: None,
            name: String::new(),
            priority: Priority::Normal,
            lane: Lane::Software,
            owner: None,
            outputs: Vec::new(),
            pending_inputs: 0,
            calls: 0,
            waiting: false,
            hw_counter_at_enter: 0,
            last_enter: None,
            submitted_at: None,
            result: None,
            hook_pending: false,
            waiters: 0,
            synced: false,
            done: Arc::new(Condvar::new()),
        }
    }

    fn clear(&mut self) {
        self.job_id = 0;
        self.state = TaskState::Free;
        self.entry = None;
        self.name.clear();
        self.owner = None;
        self.outputs.clear();
        self.pending_inputs = 0;
        self.calls = 0;
        self.waiting = false;
        self.hw_counter_at_enter = 0;
        self.last_enter = None;
        self.submitted_at = None;
        self.result = None;
        self.hook_pending = false;
        self.waiters = 0;
        self.synced = false;
    }

    /// Terminal with nothing left to run for it.
    pub(crate) fn is_settled(&self) -> bool {
        self.state.is_done() && !self.hook_pending
    }
}

pub(crate) struct TaskPool {
    slots: Vec<TaskSlot>,
    free: Vec<u32>,
    capacity: usize,
    job_counter: u32,
}

impl TaskPool {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
            job_counter: 0,
        }
    }

    /// Take a free slot (or grow up to capacity) and stamp a new job id.
    pub(crate) fn acquire(&mut self) -> Result<SyncHandle, SchedError> {
        let task_id = match self.free.pop() {
            Some(idx) => idx,
            None if self.slots.len() < self.capacity => {
                self.slots.push(TaskSlot::vacant());
                (self.slots.len() - 1) as u32
            }
            None => {
                return Err(SchedError::PoolExhausted {
                    capacity: self.capacity,
                })
            }
        };

        let job_id = self.next_job();
        let slot = &mut self.slots[task_id as usize];
        slot.clear();
        slot.job_id = job_id;
        Ok(SyncHandle::new(task_id, job_id))
    }

    /// Return a slot to the pool. A handle whose job no longer occupies the
    /// slot is ignored, so releasing twice is harmless.
    pub(crate) fn release(&mut self, handle: SyncHandle) -> bool {
        match self.get_mut(handle) {
            Some(slot) => {
                slot.clear();
                self.free.push(handle.task_id);
                true
            }
            None => false,
        }
    }

    pub(crate) fn get(&self, handle: SyncHandle) -> Option<&TaskSlot> {
        self.slots
            .get(handle.task_id as usize)
            .filter(|s| s.job_id != 0 && s.job_id == handle.job_id)
    }

    pub(crate) fn get_mut(&mut self, handle: SyncHandle) -> Option<&mut TaskSlot> {
        self.slots
            .get_mut(handle.task_id as usize)
            .filter(|s| s.job_id != 0 && s.job_id == handle.job_id)
    }

    /// Occupied slots with their current handles.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (SyncHandle, &TaskSlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.job_id != 0)
            .map(|(i, s)| (SyncHandle::new(i as u32, s.job_id), s))
    }

    pub(crate) fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    // Job ids grow evenly and skip 0 so a zeroed slot never matches.
    fn next_job(&mut self) -> u32 {
        self.job_counter = self.job_counter.wrapping_add(1);
        if self.job_counter == 0 {
            self.job_counter = 1;
        }
        self.job_counter
    }
}
