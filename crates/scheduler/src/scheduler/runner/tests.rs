use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use hwsched_core::{DependencyKey, Lane, OwnerId, Priority, PriorityWeights, SchedulerConfig};

use crate::scheduler::runner::Scheduler;
use crate::scheduler::task::{EntryPoint, SchedError, TaskDescriptor, TaskError, TaskResult, TaskStatus};
use crate::scheduler::types::{SchedulerState, TaskState};

const WAIT: Option<Duration> = Some(Duration::from_secs(10));

/// Mock entry point that replays a fixed status script and records what it saw.
struct MockTask {
    name: String,
    script: Vec<TaskStatus>,
    calls: AtomicUsize,
    workers: Mutex<Vec<usize>>,
    log: Arc<Mutex<Vec<String>>>,
    completed: Mutex<Option<TaskResult>>,
    hook_result: TaskResult,
}

impl MockTask {
    fn new(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Self {
        Self::scripted(name, log, vec![TaskStatus::Done])
    }

    fn scripted(name: &str, log: &Arc<Mutex<Vec<String>>>, script: Vec<TaskStatus>) -> Self {
        Self {
            name: name.to_string(),
            script,
            calls: AtomicUsize::new(0),
            workers: Mutex::new(Vec::new()),
            log: Arc::clone(log),
            completed: Mutex::new(None),
            hook_result: Ok(()),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn completed(&self) -> Option<TaskResult> {
        self.completed.lock().unwrap().clone()
    }
}

impl EntryPoint for MockTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, worker_index: usize, call_number: u32) -> TaskStatus {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(n, call_number as usize, "call numbers must be consecutive");
        self.workers.lock().unwrap().push(worker_index);
        self.log.lock().unwrap().push(self.name.clone());
        self.script
            .get(n)
            .copied()
            .unwrap_or(TaskStatus::Done)
    }

    fn complete(&self, result: &TaskResult) -> TaskResult {
        *self.completed.lock().unwrap() = Some(result.clone());
        self.hook_result.clone()
    }
}

/// Blocks the entry point that waits on it until the test opens it.
#[derive(Default)]
struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cv.wait(open).unwrap();
        }
    }

    fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_all();
    }
}

fn config(workers: usize) -> SchedulerConfig {
    SchedulerConfig {
        worker_threads: workers,
        idle_wait_ms: 20,
        hw_listening: false,
        priority_weights: PriorityWeights {
            low: 100,
            normal: 100,
            high: 100,
        },
        ..SchedulerConfig::default()
    }
}

fn new_log() -> Arc<Mutex<Vec<String>>> {
    Arc::new(Mutex::new(Vec::new()))
}

fn gated(gate: &Arc<Gate>, priority: Priority) -> TaskDescriptor {
    let gate = Arc::clone(gate);
    TaskDescriptor::from_fn("gate", move |_, _| {
        gate.wait();
        TaskStatus::Done
    })
    .priority(priority)
}

#[test]
fn scheduler_creation() {
    let scheduler = Scheduler::new(config(2)).unwrap();
    assert_eq!(scheduler.worker_count(), 2);
    assert_eq!(scheduler.state(), SchedulerState::Running);
    let metrics = scheduler.metrics();
    assert_eq!(metrics.tasks_submitted, 0);
    assert_eq!(metrics.pool_in_use, 0);
    assert_eq!(metrics.pool_capacity, 1024);
}

#[test]
fn invalid_config_rejected() {
    let mut cfg = config(1);
    cfg.task_pool_capacity = 0;
    assert!(matches!(Scheduler::new(cfg), Err(SchedError::Config(_))));
}

#[test]
fn submit_and_synchronize() {
    let scheduler = Scheduler::new(config(2)).unwrap();
    let log = new_log();
    let task = Arc::new(MockTask::new("decode", &log));

    let handle = scheduler.submit(TaskDescriptor::new(task.clone())).unwrap();
    scheduler.synchronize(handle, WAIT).unwrap();

    assert_eq!(task.call_count(), 1);
    assert_eq!(task.completed(), Some(Ok(())));
    let metrics = scheduler.metrics();
    assert_eq!(metrics.tasks_submitted, 1);
    assert_eq!(metrics.tasks_executed["decode"], 1);
}

#[test]
fn continuation_stays_on_worker() {
    let scheduler = Scheduler::new(config(3)).unwrap();
    let log = new_log();
    let task = Arc::new(MockTask::scripted(
        "encode",
        &log,
        vec![TaskStatus::Continue, TaskStatus::Continue, TaskStatus::Done],
    ));

    let handle = scheduler.submit(TaskDescriptor::new(task.clone())).unwrap();
    scheduler.synchronize(handle, WAIT).unwrap();

    assert_eq!(task.call_count(), 3);
    let workers = task.workers.lock().unwrap().clone();
    assert!(workers.windows(2).all(|w| w[0] == w[1]), "workers: {workers:?}");
}

#[test]
fn busy_task_retried() {
    let mut cfg = config(1);
    cfg.busy_retry_ms = 5;
    let scheduler = Scheduler::new(cfg).unwrap();
    let log = new_log();
    let task = Arc::new(MockTask::scripted(
        "hw-poll",
        &log,
        vec![TaskStatus::Busy, TaskStatus::Busy, TaskStatus::Done],
    ));

    let handle = scheduler
        .submit(TaskDescriptor::new(task.clone()).lane(Lane::Hardware))
        .unwrap();
    scheduler.synchronize(handle, WAIT).unwrap();
    assert_eq!(task.call_count(), 3);
}

#[test]
fn busy_task_woken_by_hw_event() {
    let mut cfg = config(2);
    cfg.busy_retry_ms = 60_000;
    cfg.hw_listening = true;
    cfg.hw_wakeup_interval_ms = 10;
    let scheduler = Scheduler::new(cfg).unwrap();
    let log = new_log();
    let task = Arc::new(MockTask::scripted("hw-wait", &log, vec![TaskStatus::Busy]));

    let handle = scheduler
        .submit(TaskDescriptor::new(task.clone()).lane(Lane::Hardware))
        .unwrap();

    // Parked: the retry period is far away and no event has arrived.
    assert!(matches!(
        scheduler.synchronize(handle, Some(Duration::from_millis(100))),
        Err(SchedError::Timeout(_))
    ));
    assert_eq!(task.call_count(), 1);

    scheduler.signal_hw_event();
    scheduler.synchronize(handle, WAIT).unwrap();
    assert_eq!(task.call_count(), 2);
    assert!(scheduler.metrics().hw_events >= 1);
}

#[test]
fn failed_task_reports_code() {
    let scheduler = Scheduler::new(config(1)).unwrap();
    let handle = scheduler
        .submit(TaskDescriptor::from_fn("broken", |_, _| TaskStatus::Failed(-17)))
        .unwrap();
    let err = scheduler.synchronize(handle, WAIT).unwrap_err();
    assert!(matches!(err, SchedError::Task(TaskError::Failed(-17))));
    assert_eq!(scheduler.metrics().tasks_failed["broken"], 1);
}

#[test]
fn panic_is_contained() {
    let scheduler = Scheduler::new(config(1)).unwrap();
    let handle = scheduler
        .submit(TaskDescriptor::from_fn("explodes", |_, _| panic!("bad bitstream")))
        .unwrap();
    let err = scheduler.synchronize(handle, WAIT).unwrap_err();
    match err {
        SchedError::Task(TaskError::Panicked(msg)) => assert!(msg.contains("bad bitstream")),
        other => panic!("unexpected {other:?}"),
    }

    // The worker survives and keeps running tasks.
    let next = scheduler
        .submit(TaskDescriptor::from_fn("fine", |_, _| TaskStatus::Done))
        .unwrap();
    scheduler.synchronize(next, WAIT).unwrap();
    assert_eq!(scheduler.state(), SchedulerState::Running);
    assert_eq!(scheduler.metrics().tasks_panicked, 1);
}

#[test]
fn completion_hook_error_fails_task() {
    let scheduler = Scheduler::new(config(1)).unwrap();
    let log = new_log();
    let mut task = MockTask::new("finalize", &log);
    task.hook_result = Err(TaskError::Failed(5));

    let handle = scheduler.submit(TaskDescriptor::new(Arc::new(task))).unwrap();
    assert!(matches!(
        scheduler.synchronize(handle, WAIT),
        Err(SchedError::Task(TaskError::Failed(5)))
    ));
}

#[test]
fn dependency_orders_execution() {
    let scheduler = Scheduler::new(config(4)).unwrap();
    let log = new_log();
    let surface = DependencyKey::new(0x1000);
    let gate = Arc::new(Gate::default());

    let producer = scheduler
        .submit(gated(&gate, Priority::Low).output(surface))
        .unwrap();
    let consumer_task = Arc::new(MockTask::new("consumer", &log));
    let consumer = scheduler
        .submit(
            TaskDescriptor::new(consumer_task.clone())
                .priority(Priority::High)
                .input(surface),
        )
        .unwrap();

    thread::sleep(Duration::from_millis(50));
    assert_eq!(scheduler.task_state(consumer), Some(TaskState::Blocked));
    assert_eq!(consumer_task.call_count(), 0);

    gate.open();
    scheduler.synchronize(producer, WAIT).unwrap();
    scheduler.synchronize(consumer, WAIT).unwrap();
    assert_eq!(consumer_task.call_count(), 1);
}

#[test]
fn failure_poisons_whole_subtree() {
    let scheduler = Scheduler::new(config(2)).unwrap();
    let log = new_log();
    let (k1, k2) = (DependencyKey::new(1), DependencyKey::new(2));
    let gate = Arc::new(Gate::default());

    let root = {
        let gate = Arc::clone(&gate);
        scheduler
            .submit(
                TaskDescriptor::from_fn("root", move |_, _| {
                    gate.wait();
                    TaskStatus::Failed(-1)
                })
                .output(k1),
            )
            .unwrap()
    };
    let mid_task = Arc::new(MockTask::new("mid", &log));
    let mid = scheduler
        .submit(TaskDescriptor::new(mid_task.clone()).input(k1).output(k2))
        .unwrap();
    let leaf_task = Arc::new(MockTask::new("leaf", &log));
    let leaf = scheduler
        .submit(TaskDescriptor::new(leaf_task.clone()).input(k2))
        .unwrap();

    gate.open();
    assert!(matches!(
        scheduler.synchronize(root, WAIT),
        Err(SchedError::Task(TaskError::Failed(-1)))
    ));
    assert!(matches!(
        scheduler.synchronize(mid, WAIT),
        Err(SchedError::Task(TaskError::AbortedByDependency { key })) if key == k1
    ));
    assert!(matches!(
        scheduler.synchronize(leaf, WAIT),
        Err(SchedError::Task(TaskError::AbortedByDependency { key })) if key == k2
    ));

    assert_eq!(mid_task.call_count(), 0);
    assert_eq!(leaf_task.call_count(), 0);
    // Completion hooks still run for poisoned tasks.
    assert!(matches!(leaf_task.completed(), Some(Err(TaskError::AbortedByDependency { .. }))));
    assert_eq!(scheduler.metrics().tasks_poisoned, 2);
}

#[test]
fn late_consumer_of_failed_key_is_poisoned() {
    let scheduler = Scheduler::new(config(1)).unwrap();
    let key = DependencyKey::new(77);
    let producer = scheduler
        .submit(TaskDescriptor::from_fn("bad", |_, _| TaskStatus::Failed(3)).output(key))
        .unwrap();
    assert!(scheduler.synchronize(producer, WAIT).is_err());
    assert_eq!(scheduler.state(), SchedulerState::ResetNeeded);

    let log = new_log();
    let late_task = Arc::new(MockTask::new("late", &log));
    let late = scheduler
        .submit(TaskDescriptor::new(late_task.clone()).input(key))
        .unwrap();
    assert!(matches!(
        scheduler.synchronize(late, WAIT),
        Err(SchedError::Task(TaskError::AbortedByDependency { .. }))
    ));
    assert_eq!(late_task.call_count(), 0);

    scheduler.reset();
    assert_eq!(scheduler.state(), SchedulerState::Running);

    // After reset the key is unknown again, so a consumer runs.
    let fresh = scheduler
        .submit(TaskDescriptor::from_fn("fresh", |_, _| TaskStatus::Done).input(key))
        .unwrap();
    scheduler.synchronize(fresh, WAIT).unwrap();
}

#[test]
fn timeout_leaves_task_untouched() {
    let scheduler = Scheduler::new(config(1)).unwrap();
    let gate = Arc::new(Gate::default());
    let handle = scheduler.submit(gated(&gate, Priority::Normal)).unwrap();

    let err = scheduler
        .synchronize(handle, Some(Duration::from_millis(30)))
        .unwrap_err();
    assert!(matches!(err, SchedError::Timeout(_)));
    assert!(scheduler.task_state(handle).map_or(false, |s| s.is_live()));

    gate.open();
    scheduler.synchronize(handle, WAIT).unwrap();
}

#[test]
fn handle_is_stale_after_synchronize() {
    let scheduler = Scheduler::new(config(1)).unwrap();
    let handle = scheduler
        .submit(TaskDescriptor::from_fn("once", |_, _| TaskStatus::Done))
        .unwrap();
    scheduler.synchronize(handle, WAIT).unwrap();
    assert!(matches!(
        scheduler.synchronize(handle, WAIT),
        Err(SchedError::StaleHandle(h)) if h == handle
    ));
    assert_eq!(scheduler.task_state(handle), None);
}

#[test]
fn pool_exhaustion_is_retryable() {
    let mut cfg = config(1);
    cfg.task_pool_capacity = 2;
    let scheduler = Scheduler::new(cfg).unwrap();
    let gate = Arc::new(Gate::default());

    let a = scheduler.submit(gated(&gate, Priority::Normal)).unwrap();
    let b = scheduler.submit(gated(&gate, Priority::Normal)).unwrap();
    let err = scheduler.submit(gated(&gate, Priority::Normal)).unwrap_err();
    assert!(matches!(err, SchedError::PoolExhausted { capacity: 2 }));
    assert!(err.is_retryable());

    gate.open();
    scheduler.synchronize(a, WAIT).unwrap();
    scheduler.synchronize(b, WAIT).unwrap();
    assert!(scheduler.submit(gated(&gate, Priority::Normal)).is_ok());
}

#[test]
fn pending_key_collision() {
    let scheduler = Scheduler::new(config(1)).unwrap();
    let gate = Arc::new(Gate::default());
    let key = DependencyKey::new(5);
    let first = scheduler.submit(gated(&gate, Priority::Normal).output(key)).unwrap();
    let err = scheduler
        .submit(TaskDescriptor::from_fn("dup", |_, _| TaskStatus::Done).output(key))
        .unwrap_err();
    assert!(matches!(err, SchedError::KeyCollision(k) if k == key));
    gate.open();
    scheduler.synchronize(first, WAIT).unwrap();
}

#[test]
fn wait_for_dependency() {
    let scheduler = Scheduler::new(config(2)).unwrap();
    let gate = Arc::new(Gate::default());
    let key = DependencyKey::new(9);

    // Never registered.
    scheduler.wait_for_dependency_resolved(DependencyKey::new(10), WAIT).unwrap();

    let producer = scheduler.submit(gated(&gate, Priority::Normal).output(key)).unwrap();
    assert!(matches!(
        scheduler.wait_for_dependency_resolved(key, Some(Duration::from_millis(20))),
        Err(SchedError::Timeout(_))
    ));

    gate.open();
    scheduler.wait_for_dependency_resolved(key, WAIT).unwrap();
    // The dependency wait does not consume the producer's result.
    scheduler.synchronize(producer, WAIT).unwrap();
}

#[test]
fn owner_teardown_waits_and_reclaims() {
    let scheduler = Scheduler::new(config(2)).unwrap();
    let owner = OwnerId::new();
    let other = OwnerId::new();
    let log = new_log();
    let mut tasks = Vec::new();

    for i in 0..8 {
        let task = Arc::new(MockTask::scripted(
            &format!("frame-{i}"),
            &log,
            vec![TaskStatus::Continue, TaskStatus::Done],
        ));
        scheduler
            .submit(TaskDescriptor::new(task.clone()).owner(owner))
            .unwrap();
        tasks.push(task);
    }
    let gate = Arc::new(Gate::default());
    let foreign = scheduler.submit(gated(&gate, Priority::Low).owner(other)).unwrap();

    scheduler.wait_for_all_tasks_completion(owner);

    assert!(tasks.iter().all(|t| t.call_count() == 2));
    // Only the other owner's task still holds a slot.
    assert_eq!(scheduler.metrics().pool_in_use, 1);

    gate.open();
    scheduler.synchronize(foreign, WAIT).unwrap();
}

#[test]
fn reset_waiting_status_retries_parked_tasks() {
    let mut cfg = config(1);
    cfg.busy_retry_ms = 60_000;
    let scheduler = Scheduler::new(cfg).unwrap();
    let owner = OwnerId::new();
    let log = new_log();
    let task = Arc::new(MockTask::scripted("parked", &log, vec![TaskStatus::Busy]));

    let handle = scheduler
        .submit(TaskDescriptor::new(task.clone()).owner(owner))
        .unwrap();
    assert!(scheduler.synchronize(handle, Some(Duration::from_millis(50))).is_err());
    assert_eq!(task.call_count(), 1);

    scheduler.reset_waiting_status(owner);
    scheduler.synchronize(handle, WAIT).unwrap();
    assert_eq!(task.call_count(), 2);
}

#[test]
fn parked_tasks_are_tracked_per_owner() {
    let mut cfg = config(1);
    cfg.busy_retry_ms = 60_000;
    let scheduler = Scheduler::new(cfg).unwrap();
    let (owner, other) = (OwnerId::new(), OwnerId::new());
    let log = new_log();
    let task = Arc::new(MockTask::scripted("parked", &log, vec![TaskStatus::Busy]));

    let handle = scheduler
        .submit(TaskDescriptor::new(task.clone()).owner(owner))
        .unwrap();
    for _ in 0..1000 {
        if task.call_count() == 1 && scheduler.task_state(handle) == Some(TaskState::Ready) {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    {
        let core = scheduler.inner.lock_core();
        assert_eq!(core.parked.len(), 1);
        assert!(core.parked[&owner].contains(&handle));
    }

    // Another owner's work neither retries nor forgets this one.
    let foreign = scheduler
        .submit(TaskDescriptor::new(Arc::new(MockTask::new("foreign", &log))).owner(other))
        .unwrap();
    scheduler.synchronize(foreign, WAIT).unwrap();
    assert_eq!(task.call_count(), 1);
    assert!(scheduler.inner.lock_core().parked.contains_key(&owner));

    scheduler.reset_waiting_status(owner);
    scheduler.synchronize(handle, WAIT).unwrap();
    assert_eq!(task.call_count(), 2);
    assert!(scheduler.inner.lock_core().parked.is_empty());
}

#[test]
fn single_worker_runs_fifo_within_class() {
    let scheduler = Scheduler::new(config(1)).unwrap();
    let log = new_log();
    let gate = Arc::new(Gate::default());
    let blocker = scheduler.submit(gated(&gate, Priority::High)).unwrap();

    let mut handles = Vec::new();
    for name in ["c", "d", "e"] {
        let task = Arc::new(MockTask::new(name, &log));
        handles.push(scheduler.submit(TaskDescriptor::new(task)).unwrap());
    }
    gate.open();
    scheduler.synchronize(blocker, WAIT).unwrap();
    for h in handles {
        scheduler.synchronize(h, WAIT).unwrap();
    }
    assert_eq!(*log.lock().unwrap(), vec!["c", "d", "e"]);
}

#[test]
fn higher_class_runs_first() {
    let scheduler = Scheduler::new(config(1)).unwrap();
    let log = new_log();
    let gate = Arc::new(Gate::default());
    let blocker = scheduler.submit(gated(&gate, Priority::High)).unwrap();

    let mut handles = Vec::new();
    for (name, p) in [("low", Priority::Low), ("normal", Priority::Normal), ("high", Priority::High)] {
        let task = Arc::new(MockTask::new(name, &log));
        handles.push(scheduler.submit(TaskDescriptor::new(task).priority(p)).unwrap());
    }
    gate.open();
    scheduler.synchronize(blocker, WAIT).unwrap();
    for h in handles {
        scheduler.synchronize(h, WAIT).unwrap();
    }
    assert_eq!(*log.lock().unwrap(), vec!["high", "normal", "low"]);
}

#[test]
fn fairness_lets_low_ahead_of_normal() {
    let mut cfg = config(1);
    cfg.priority_weights = PriorityWeights::default();
    let scheduler = Scheduler::new(cfg).unwrap();
    let log = new_log();
    let gate = Arc::new(Gate::default());

    // Normal-class time with no Low time puts Normal over its share.
    let gate_task = Arc::clone(&gate);
    let blocker = scheduler
        .submit(
            TaskDescriptor::from_fn("normal-burst", move |_, _| {
                gate_task.wait();
                thread::sleep(Duration::from_millis(5));
                TaskStatus::Done
            })
            .priority(Priority::Normal),
        )
        .unwrap();

    let normal = Arc::new(MockTask::new("normal", &log));
    let low = Arc::new(MockTask::new("low", &log));
    let hn = scheduler.submit(TaskDescriptor::new(normal).priority(Priority::Normal)).unwrap();
    let hl = scheduler.submit(TaskDescriptor::new(low).priority(Priority::Low)).unwrap();

    gate.open();
    for h in [blocker, hn, hl] {
        scheduler.synchronize(h, WAIT).unwrap();
    }
    assert_eq!(*log.lock().unwrap(), vec!["low", "normal"]);
}

#[test]
fn dedicated_worker_owns_hardware_lane() {
    let scheduler = Scheduler::new(config(3)).unwrap();
    let log = new_log();
    let mut tasks = Vec::new();
    let mut handles = Vec::new();
    for i in 0..6 {
        let task = Arc::new(MockTask::new(&format!("hw-{i}"), &log));
        handles.push(
            scheduler
                .submit(TaskDescriptor::new(task.clone()).lane(Lane::Hardware))
                .unwrap(),
        );
        tasks.push(task);
    }
    for h in handles {
        scheduler.synchronize(h, WAIT).unwrap();
    }
    for task in &tasks {
        assert_eq!(*task.workers.lock().unwrap(), vec![0]);
    }
}

#[test]
fn shutdown_aborts_unrun_tasks() {
    let scheduler = Scheduler::new(config(1)).unwrap();
    let log = new_log();
    let key = DependencyKey::new(3);
    let gate = Arc::new(Gate::default());

    let producer = scheduler.submit(gated(&gate, Priority::Normal).output(key)).unwrap();
    let blocked_task = Arc::new(MockTask::new("blocked", &log));
    let blocked = scheduler
        .submit(TaskDescriptor::new(blocked_task.clone()).input(key))
        .unwrap();

    while scheduler.task_state(producer) != Some(TaskState::Running) {
        thread::sleep(Duration::from_millis(1));
    }
    let opener = {
        let gate = Arc::clone(&gate);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            gate.open();
        })
    };
    scheduler.shutdown();
    opener.join().unwrap();

    assert_eq!(scheduler.state(), SchedulerState::Failed);
    assert!(matches!(
        scheduler.submit(TaskDescriptor::from_fn("late", |_, _| TaskStatus::Done)),
        Err(SchedError::ShutDown)
    ));
    // The running producer finished; the consumer it released never ran.
    scheduler.synchronize(producer, WAIT).unwrap();
    assert!(matches!(
        scheduler.synchronize(blocked, WAIT),
        Err(SchedError::Task(_))
    ));
    assert_eq!(blocked_task.call_count(), 0);
    assert!(blocked_task.completed().is_some());
}

#[test]
fn hw_listening_toggles() {
    let scheduler = Scheduler::new(config(1)).unwrap();
    assert!(!scheduler.is_hw_listening());
    scheduler.start_hw_listening().unwrap();
    scheduler.start_hw_listening().unwrap();
    assert!(scheduler.is_hw_listening());
    scheduler.stop_hw_listening();
    assert!(!scheduler.is_hw_listening());
}
