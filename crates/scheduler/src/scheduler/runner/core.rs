use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use hwsched_core::{Config, Lane, OwnerId, Priority, SchedulerConfig};
use tracing::{info, warn};

use crate::scheduler::dependency::DependencyTable;
use crate::scheduler::fairness::FairnessWindow;
use crate::scheduler::metrics::SchedulerMetrics;
use crate::scheduler::pool::TaskPool;
use crate::scheduler::queues::ReadyQueues;
use crate::scheduler::task::{SchedError, TaskError};
use crate::scheduler::types::{SchedulerState, SyncHandle, TaskState};

/// The task scheduler. Owns a fixed pool of worker threads plus an optional
/// hardware wake-up thread, and executes submitted tasks in dependency,
/// priority and lane order.
///
/// Share it between components as `Arc<Scheduler>`. Dropping the last
/// reference shuts the workers down and aborts whatever never ran.
pub struct Scheduler {
    pub(super) inner: Arc<Inner>,
    pub(super) threads: Mutex<Threads>,
}

#[derive(Default)]
pub(super) struct Threads {
    pub(super) workers: Vec<JoinHandle<()>>,
    pub(super) wakeup: Option<JoinHandle<()>>,
}

/// State shared with the worker and wake-up threads.
pub(super) struct Inner {
    pub(super) config: SchedulerConfig,
    pub(super) worker_count: usize,
    /// Pool, dependency table, ready queues and worker flags.
    pub(super) core: Mutex<Core>,
    /// One wake condition per worker, paired with `core`.
    pub(super) worker_wake: Vec<Condvar>,
    /// Notified on every terminal transition, paired with `core`.
    pub(super) task_done: Condvar,
    pub(super) fairness: Mutex<FairnessWindow>,
    pub(super) metrics: RwLock<SchedulerMetrics>,
    /// Hardware completion events seen so far.
    pub(super) hw_counter: AtomicU64,
    pub(super) hw: Mutex<HwState>,
    pub(super) hw_wake: Condvar,
    pub(super) active_workers: AtomicUsize,
    pub(super) worker_died: AtomicBool,
}

pub(super) struct Core {
    pub(super) pool: TaskPool,
    pub(super) deps: DependencyTable,
    pub(super) queues: ReadyQueues,
    pub(super) workers: Vec<WorkerSlot>,
    /// Queued tasks parked after `Busy`, by owner.
    pub(super) parked: HashMap<OwnerId, HashSet<SyncHandle>>,
    pub(super) shut_down: bool,
}

impl Core {
    pub(super) fn park(&mut self, owner: Option<OwnerId>, handle: SyncHandle) {
        if let Some(owner) = owner {
            self.parked.entry(owner).or_default().insert(handle);
        }
    }

    pub(super) fn unpark(&mut self, owner: Option<OwnerId>, handle: SyncHandle) {
        let Some(owner) = owner else {
            return;
        };
        if let Entry::Occupied(mut parked) = self.parked.entry(owner) {
            parked.get_mut().remove(&handle);
            if parked.get().is_empty() {
                parked.remove();
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub(super) struct WorkerSlot {
    /// Parked in its wake condition with nothing to run.
    pub(super) waiting: bool,
}

#[derive(Debug, Default)]
pub(super) struct HwState {
    pub(super) stop: bool,
}

pub(super) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(super) fn wait_timeout_unpoisoned<'a, T>(
    cv: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
) -> MutexGuard<'a, T> {
    match cv.wait_timeout(guard, timeout) {
        Ok((guard, _)) => guard,
        Err(poisoned) => poisoned.into_inner().0,
    }
}

impl Scheduler {
    /// Validate `config`, spawn the worker threads and, when
    /// `hw_listening` is set, the wake-up thread.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedError> {
        config.validate()?;
        let worker_count = config.resolved_worker_threads().max(1);

        let core = Core {
            pool: TaskPool::with_capacity(config.task_pool_capacity),
            deps: DependencyTable::with_capacity(config.dependency_capacity),
            queues: ReadyQueues::new(),
            workers: vec![WorkerSlot::default(); worker_count],
            parked: HashMap::new(),
            shut_down: false,
        };
        let metrics = SchedulerMetrics {
            pool_capacity: config.task_pool_capacity,
            ..SchedulerMetrics::default()
        };

        let inner = Arc::new(Inner {
            fairness: Mutex::new(FairnessWindow::new(
                config.fairness_window(),
                config.fairness_buckets,
            )),
            worker_count,
            core: Mutex::new(core),
            worker_wake: (0..worker_count).map(|_| Condvar::new()).collect(),
            task_done: Condvar::new(),
            metrics: RwLock::new(metrics),
            hw_counter: AtomicU64::new(0),
            hw: Mutex::new(HwState::default()),
            hw_wake: Condvar::new(),
            active_workers: AtomicUsize::new(0),
            worker_died: AtomicBool::new(false),
            config,
        });

        let scheduler = Self {
            inner,
            threads: Mutex::new(Threads::default()),
        };

        info!(
            workers = worker_count,
            pool = scheduler.inner.config.task_pool_capacity,
            dedicated_hw = scheduler.inner.config.dedicated_hardware_worker,
            "Scheduler starting"
        );

        for index in 0..worker_count {
            let inner = Arc::clone(&scheduler.inner);
            let handle = thread::Builder::new()
                .name(format!("hwsched-worker-{index}"))
                .spawn(move || inner.worker_loop(index))?;
            lock_unpoisoned(&scheduler.threads).workers.push(handle);
        }

        if scheduler.inner.config.hw_listening {
            scheduler.start_hw_listening()?;
        }

        Ok(scheduler)
    }

    /// Build from a loaded [`Config`].
    pub fn from_config(config: &Config) -> Result<Self, SchedError> {
        Self::new(config.scheduler.clone())
    }

    /// Parameters the scheduler was built with.
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn worker_count(&self) -> usize {
        self.inner.worker_count
    }

    /// Coarse health: `Failed` after shutdown or if a worker thread died,
    /// `ResetNeeded` while failed dependency results are retained.
    pub fn state(&self) -> SchedulerState {
        if self.inner.worker_died.load(Ordering::Acquire) {
            return SchedulerState::Failed;
        }
        let core = self.inner.lock_core();
        if core.shut_down {
            SchedulerState::Failed
        } else if core.deps.has_failed() {
            SchedulerState::ResetNeeded
        } else {
            SchedulerState::Running
        }
    }

    /// Current state of a task, or `None` if the handle is stale.
    pub fn task_state(&self, handle: SyncHandle) -> Option<TaskState> {
        self.inner.lock_core().pool.get(handle).map(|s| s.state)
    }

    /// Get a snapshot of the current scheduler metrics.
    pub fn metrics(&self) -> SchedulerMetrics {
        let (pending, in_use, deps) = {
            let core = self.inner.lock_core();
            let mut pending = [0usize; Priority::COUNT];
            for (_, slot) in core.pool.iter() {
                if matches!(slot.state, TaskState::Blocked | TaskState::Ready) {
                    pending[slot.priority.index()] += 1;
                }
            }
            (pending, core.pool.in_use(), core.deps.stats())
        };

        let mut m = self
            .inner
            .metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for p in Priority::ALL {
            m.tasks_pending.insert(p, pending[p.index()]);
        }
        m.pool_in_use = in_use;
        m.dependencies_pending = deps.pending;
        m.dependencies_failed = deps.failed;
        m.hw_events = self.inner.hw_counter.load(Ordering::Acquire);
        let active = self.inner.active_workers.load(Ordering::Relaxed);
        m.worker_utilization = active as f64 / self.inner.worker_count as f64;
        m
    }

    /// Stop accepting work, join the workers and abort every task that
    /// never ran with [`TaskError::Aborted`]. Running calls finish first.
    /// Idempotent.
    pub fn shutdown(&self) {
        {
            let mut core = self.inner.lock_core();
            if core.shut_down {
                return;
            }
            info!("Scheduler shutdown requested");
            core.shut_down = true;
            for cv in &self.inner.worker_wake {
                cv.notify_all();
            }
        }

        self.stop_hw_listening();

        let workers = std::mem::take(&mut lock_unpoisoned(&self.threads).workers);
        let current = thread::current().id();
        for handle in workers {
            // An entry point may drop the last reference from a worker.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }

        let aborted = self.inner.abort_unfinished();
        info!(aborted, "Scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.inner.worker_count)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Inner {
    pub(super) fn lock_core(&self) -> MutexGuard<'_, Core> {
        lock_unpoisoned(&self.core)
    }

    pub(super) fn metrics_mut(&self) -> RwLockWriteGuard<'_, SchedulerMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Worker 0 is the dedicated hardware worker when the policy is on and
    /// there is at least one other worker to take software work.
    pub(super) fn is_dedicated(&self, index: usize) -> bool {
        self.config.dedicated_hardware_worker && index == 0 && self.worker_count > 1
    }

    /// Lanes `index` may take tasks from, in scan order.
    pub(super) fn lanes_for(&self, index: usize) -> &'static [Lane] {
        if !self.config.dedicated_hardware_worker || index == 0 {
            &Lane::ALL
        } else {
            &[Lane::Software]
        }
    }

    /// Wake up to `dedicated` parked dedicated workers and `regular` parked
    /// regular workers. Returns how many were woken.
    pub(super) fn wake_workers(&self, core: &mut Core, dedicated: usize, regular: usize) -> usize {
        let (mut dedicated, mut regular) = (dedicated, regular);
        let mut woken = 0;
        for (index, worker) in core.workers.iter_mut().enumerate() {
            if !worker.waiting {
                continue;
            }
            let budget = if self.is_dedicated(index) {
                &mut dedicated
            } else {
                &mut regular
            };
            if *budget == 0 {
                continue;
            }
            *budget -= 1;
            worker.waiting = false;
            self.worker_wake[index].notify_one();
            woken += 1;
        }
        woken
    }

    /// Wake one worker able to run a task on `lane`.
    pub(super) fn wake_for_lane(&self, core: &mut Core, lane: Lane) {
        if self.worker_count == 1 {
            self.wake_workers(core, 0, 1);
        } else if lane == Lane::Hardware && self.config.dedicated_hardware_worker {
            self.wake_workers(core, 1, 0);
        } else if self.wake_workers(core, 0, 1) == 0 {
            // Every regular worker is busy; the dedicated one also takes
            // software work.
            self.wake_workers(core, 1, 0);
        }
    }

    pub(super) fn wake_all(&self, core: &mut Core) {
        for (index, worker) in core.workers.iter_mut().enumerate() {
            if worker.waiting {
                worker.waiting = false;
                self.worker_wake[index].notify_one();
            }
        }
    }

    /// Fail every task still queued or blocked with [`TaskError::Aborted`].
    /// A call still running (shutdown from inside an entry point) is left
    /// to finish normally.
    fn abort_unfinished(&self) -> usize {
        let mut core = self.lock_core();
        core.queues.drain();
        let live: Vec<SyncHandle> = core
            .pool
            .iter()
            .filter(|(_, s)| matches!(s.state, TaskState::Blocked | TaskState::Ready))
            .map(|(h, _)| h)
            .collect();

        let mut hooks = Vec::new();
        let mut aborted = 0;
        for handle in live {
            // Earlier aborts may already have poisoned this one.
            let queued = core
                .pool
                .get(handle)
                .map_or(false, |s| matches!(s.state, TaskState::Blocked | TaskState::Ready));
            if queued {
                let done = self.finish_task(&mut core, handle, Err(TaskError::Aborted), true);
                aborted += done.finished;
                hooks.extend(done.hooks);
            }
        }
        drop(core);

        self.metrics_mut().tasks_aborted += aborted as u64;
        self.run_completion_hooks(hooks);
        aborted
    }
}
