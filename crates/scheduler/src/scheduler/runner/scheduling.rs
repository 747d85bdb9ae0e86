use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use hwsched_core::Priority;
use tracing::error;

use crate::scheduler::pool::TaskPool;
use crate::scheduler::task::EntryPoint;
use crate::scheduler::types::{SyncHandle, TaskState};

use super::core::{lock_unpoisoned, Core, Inner};

/// A task claimed by a worker, ready to be called outside the core lock.
pub(super) struct Dispatch {
    pub(super) handle: SyncHandle,
    pub(super) entry: Arc<dyn EntryPoint>,
    pub(super) name: String,
    pub(super) priority: Priority,
    pub(super) call_number: u32,
}

impl Inner {
    /// Pick the next task for worker `index` and mark it Running.
    ///
    /// `previous` is the task this worker just ran if it asked to continue.
    /// It is re-dispatched unless a strictly higher class has eligible work
    /// for this worker. Otherwise the budget pass skips classes over their
    /// fairness share, and the regular pass takes anything eligible.
    pub(super) fn select(
        &self,
        core: &mut Core,
        index: usize,
        previous: Option<SyncHandle>,
    ) -> Option<Dispatch> {
        let lanes = self.lanes_for(index);
        let now = Instant::now();
        let hw_now = self.hw_counter.load(Ordering::Acquire);
        let busy_retry = self.config.busy_retry();

        let eligible = |pool: &TaskPool, handle: SyncHandle| {
            pool.get(handle).map_or(false, |slot| {
                slot.state == TaskState::Ready
                    && (!slot.waiting
                        || slot.hw_counter_at_enter != hw_now
                        || slot
                            .last_enter
                            .map_or(true, |t| now.saturating_duration_since(t) >= busy_retry))
            })
        };

        if let Some(prev) = previous {
            let prev_slot = core
                .pool
                .get(prev)
                .filter(|s| s.state == TaskState::Ready)
                .map(|s| (s.priority, s.lane));
            if let Some((priority, lane)) = prev_slot {
                let Core { pool, queues, .. } = &mut *core;
                let pool: &TaskPool = pool;
                let preempted = Priority::ALL
                    .iter()
                    .filter(|p| **p > priority)
                    .any(|p| {
                        lanes
                            .iter()
                            .any(|l| queues.any(*p, *l, |h| eligible(pool, *h)))
                    });
                if !preempted && queues.remove(priority, lane, prev) {
                    if let Some(dispatch) = self.claim(core, prev, hw_now, now) {
                        return Some(dispatch);
                    }
                }
            }
        }

        let budget: [bool; Priority::COUNT] = {
            let mut fairness = lock_unpoisoned(&self.fairness);
            let mut out = [true; Priority::COUNT];
            for p in Priority::ALL {
                out[p.index()] = fairness.within_budget(p, &self.config.priority_weights);
            }
            out
        };

        let budget_pass = budget.iter().any(|b| !b);
        let passes: &[bool] = if budget_pass { &[true, false] } else { &[false] };

        for &respect_budget in passes {
            for priority in Priority::ALL {
                if respect_budget && !budget[priority.index()] {
                    continue;
                }
                for &lane in lanes {
                    let Core { pool, queues, .. } = &mut *core;
                    let pool: &TaskPool = pool;
                    if let Some(handle) = queues.take_first(priority, lane, |h| eligible(pool, h)) {
                        if let Some(dispatch) = self.claim(core, handle, hw_now, now) {
                            return Some(dispatch);
                        }
                    }
                }
            }
        }
        None
    }

    /// Whether anything queued for this worker is parked after `Busy`, in
    /// which case idle waits are shortened to the retry period.
    pub(super) fn has_busy_work(&self, core: &Core, index: usize) -> bool {
        let lanes = self.lanes_for(index);
        core.queues.iter().any(|h| {
            core.pool
                .get(h)
                .map_or(false, |s| s.waiting && lanes.contains(&s.lane))
        })
    }

    fn claim(
        &self,
        core: &mut Core,
        handle: SyncHandle,
        hw_now: u64,
        now: Instant,
    ) -> Option<Dispatch> {
        let Some(slot) = core.pool.get_mut(handle) else {
            error!(%handle, "queued handle has no live slot");
            return None;
        };
        let Some(entry) = slot.entry.clone() else {
            error!(%handle, state = ?slot.state, "queued task has no entry point");
            return None;
        };
        let was_parked = std::mem::replace(&mut slot.waiting, false);
        slot.state = TaskState::Running;
        slot.hw_counter_at_enter = hw_now;
        slot.last_enter = Some(now);
        let owner = slot.owner;
        let dispatch = Dispatch {
            handle,
            entry,
            name: slot.name.clone(),
            priority: slot.priority,
            call_number: slot.calls,
        };
        if was_parked {
            core.unpark(owner, handle);
        }
        Some(dispatch)
    }
}
