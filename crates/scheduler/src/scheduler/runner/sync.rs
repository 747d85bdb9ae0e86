use std::sync::PoisonError;
use std::time::{Duration, Instant};

use hwsched_core::{DependencyKey, OwnerId};
use tracing::{debug, info};

use crate::scheduler::dependency::Lookup;
use crate::scheduler::pool::TaskSlot;
use crate::scheduler::task::{SchedError, TaskResult};
use crate::scheduler::types::SyncHandle;

use super::core::{wait_timeout_unpoisoned, Core, Inner};
use super::Scheduler;

/// Fallback poll period for owner-wide waits.
const OWNER_POLL: Duration = Duration::from_millis(5);

impl Scheduler {
    /// Block until the task behind `handle` is done and return its result.
    ///
    /// `None` waits forever. On timeout the task is left exactly as it was
    /// and [`SchedError::Timeout`] is returned, so the call can be retried.
    /// Once a result has been returned and no other thread is waiting on
    /// the same handle, the slot goes back to the pool and the handle
    /// becomes stale.
    pub fn synchronize(
        &self,
        handle: SyncHandle,
        timeout: Option<Duration>,
    ) -> Result<(), SchedError> {
        let result = self.inner.wait_done(handle, timeout, true)?;
        result.map_err(SchedError::from)
    }

    /// Wait until `key` is no longer pending.
    ///
    /// Unknown keys (never registered, or produced successfully) resolve
    /// immediately. A retained failure is returned as the error. The
    /// producer's slot is not reclaimed by this wait.
    pub fn wait_for_dependency_resolved(
        &self,
        key: DependencyKey,
        timeout: Option<Duration>,
    ) -> Result<(), SchedError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let lookup = self.inner.lock_core().deps.lookup(key);
            match lookup {
                Lookup::Unknown => return Ok(()),
                Lookup::Resolved(result) => return result.map_err(SchedError::from),
                Lookup::Pending(producer) => {
                    let remaining = match deadline {
                        None => None,
                        Some(d) => {
                            let now = Instant::now();
                            if now >= d {
                                return Err(SchedError::Timeout(timeout.unwrap_or_default()));
                            }
                            Some(d - now)
                        }
                    };
                    match self.inner.wait_done(producer, remaining, false) {
                        // The producer finished; the table says how.
                        Ok(_) | Err(SchedError::StaleHandle(_)) => {}
                        Err(SchedError::Timeout(_)) => {
                            return Err(SchedError::Timeout(timeout.unwrap_or_default()))
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    /// Wait until no task of `owner` is Blocked, Ready or Running, then
    /// return its finished slots to the pool.
    ///
    /// Used when a component is torn down. Parked `Busy` tasks of the owner
    /// are released first so they cannot hold the wait up.
    pub fn wait_for_all_tasks_completion(&self, owner: OwnerId) {
        let mut core = self.inner.lock_core();
        self.inner.reset_owner_waiting(&mut core, owner);
        self.inner.wake_all(&mut core);

        while core
            .pool
            .iter()
            .any(|(_, s)| s.owner == Some(owner) && !s.is_settled())
        {
            core = wait_timeout_unpoisoned(&self.inner.task_done, core, OWNER_POLL);
        }

        let reclaimed = sweep(&mut core, |s| s.owner == Some(owner));
        debug!(%owner, reclaimed, "owner quiescent");
    }

    /// Clear the `Busy` parking of `owner`'s queued tasks so they are retried
    /// immediately. Running tasks are not touched.
    pub fn reset_waiting_status(&self, owner: OwnerId) {
        let mut core = self.inner.lock_core();
        let cleared = self.inner.reset_owner_waiting(&mut core, owner);
        if cleared > 0 {
            self.inner.wake_all(&mut core);
        }
    }

    /// Recover after failures: forget retained dependency failures and
    /// reclaim finished slots nobody synchronized. Live tasks are untouched.
    pub fn reset(&self) {
        let mut core = self.inner.lock_core();
        let failed_keys = core.deps.clear_failed();
        let reclaimed = sweep(&mut core, |_| true);
        info!(failed_keys, reclaimed, "Scheduler reset");
    }
}

/// Release finished slots matching `filter` that no thread is waiting on.
fn sweep(core: &mut Core, filter: impl Fn(&TaskSlot) -> bool) -> usize {
    let done: Vec<SyncHandle> = core
        .pool
        .iter()
        .filter(|(_, s)| s.is_settled() && s.waiters == 0 && filter(s))
        .map(|(h, _)| h)
        .collect();
    for handle in &done {
        core.pool.release(*handle);
    }
    done.len()
}

impl Inner {
    /// Wait for `handle` to reach a terminal state. With `reclaim` set the
    /// result counts as consumed; once that has happened the last waiter
    /// out, of either kind, returns the slot to the pool.
    pub(super) fn wait_done(
        &self,
        handle: SyncHandle,
        timeout: Option<Duration>,
        reclaim: bool,
    ) -> Result<TaskResult, SchedError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut core = self.lock_core();

        let done_cv = match core.pool.get_mut(handle) {
            Some(slot) => {
                slot.waiters += 1;
                slot.done.clone()
            }
            None => return Err(SchedError::StaleHandle(handle)),
        };

        loop {
            let settled = match core.pool.get(handle) {
                Some(slot) => slot.is_settled(),
                None => return Err(SchedError::StaleHandle(handle)),
            };
            if settled {
                break;
            }

            match deadline {
                None => {
                    core = done_cv
                        .wait(core)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        if let Some(slot) = core.pool.get_mut(handle) {
                            slot.waiters -= 1;
                        }
                        return Err(SchedError::Timeout(timeout.unwrap_or_default()));
                    }
                    core = wait_timeout_unpoisoned(&done_cv, core, d - now);
                }
            }
        }

        let Some(slot) = core.pool.get_mut(handle) else {
            return Err(SchedError::StaleHandle(handle));
        };
        slot.waiters -= 1;
        slot.synced |= reclaim;
        let result = slot.result.clone().unwrap_or(Ok(()));
        if slot.synced && slot.waiters == 0 {
            core.pool.release(handle);
        }
        Ok(result)
    }
}
