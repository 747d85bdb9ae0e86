use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hwsched_core::Priority;
use serde::Serialize;

/// Scheduler operational metrics, dumped as JSON by `sched-worker`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    /// Terminal executions by entry point name.
    pub tasks_executed: HashMap<String, u64>,
    /// Failed executions by entry point name (own failure or panic).
    pub tasks_failed: HashMap<String, u64>,
    /// Average wall time per call by entry point name.
    pub avg_task_duration: HashMap<String, Duration>,
    /// Last terminal execution by entry point name.
    pub last_run: HashMap<String, DateTime<Utc>>,
    pub tasks_submitted: u64,
    /// Tasks failed without running because an input failed.
    pub tasks_poisoned: u64,
    pub tasks_panicked: u64,
    /// Tasks aborted by shutdown.
    pub tasks_aborted: u64,
    /// Queued or blocked tasks per priority class.
    pub tasks_pending: HashMap<Priority, usize>,
    pub pool_in_use: usize,
    pub pool_capacity: usize,
    pub dependencies_pending: usize,
    pub dependencies_failed: usize,
    /// Hardware completion events observed.
    pub hw_events: u64,
    /// Share of workers currently running an entry point (0.0 - 1.0).
    pub worker_utilization: f64,
    #[serde(skip)]
    pub(crate) call_counts: HashMap<String, u64>,
}

impl SchedulerMetrics {
    /// Record one call of an entry point.
    pub fn record_call(&mut self, task_name: &str, duration: Duration) {
        let count = {
            let calls = self.call_counts.entry(task_name.to_string()).or_default();
            *calls += 1;
            *calls
        };

        let prev_avg = self
            .avg_task_duration
            .get(task_name)
            .copied()
            .unwrap_or_default();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count == 1 {
            duration
        } else {
            let prev_nanos = prev_avg.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };

        self.avg_task_duration
            .insert(task_name.to_string(), new_avg);
    }

    /// Record that a task reached a terminal state after running.
    pub fn record_execution(&mut self, task_name: &str, succeeded: bool) {
        *self.tasks_executed.entry(task_name.to_string()).or_default() += 1;
        if !succeeded {
            *self.tasks_failed.entry(task_name.to_string()).or_default() += 1;
        }
        self.last_run.insert(task_name.to_string(), Utc::now());
    }

    pub fn total_executed(&self) -> u64 {
        self.tasks_executed.values().sum()
    }

    pub fn total_failed(&self) -> u64 {
        self.tasks_failed.values().sum()
    }
}
