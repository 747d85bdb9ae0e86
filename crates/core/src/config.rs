use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::ids::Priority;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

/// Overwrite `field` with the profiled env value when present and parseable.
fn override_from_env<T: FromStr>(profile: &str, key: &str, field: &mut T) {
    if let Some(raw) = profiled_env_opt(profile, key) {
        match raw.parse() {
            Ok(v) => *field = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable env override"),
        }
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `HWSCHED_PROFILE` env var. When set (e.g. `LOWLAT`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("HWSCHED_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let mut config = Self {
            profile: profile.to_uppercase(),
            ..Self::default()
        };
        let p = config.profile.clone();
        config.apply_env_overrides(&p);
        config
    }

    /// Parse a TOML config file as written. Env overrides are not applied;
    /// use [`Config::load`] to layer them on top.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Parse a TOML config file, then apply profiled env overrides.
    /// The profile is `HWSCHED_PROFILE` when set, else the file's `profile`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        let profile = env_opt("HWSCHED_PROFILE").unwrap_or_else(|| config.profile.clone());
        config.profile = profile.to_uppercase();
        let p = config.profile.clone();
        config.apply_env_overrides(&p);
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Layer profiled env vars over the current values.
    pub fn apply_env_overrides(&mut self, profile: &str) {
        self.scheduler.apply_env_profiled(profile);
        self.log.apply_env_profiled(profile);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate()
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        let s = &self.scheduler;
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  scheduler:   workers={}, pool={}, dependencies={}",
            s.resolved_worker_threads(),
            s.task_pool_capacity,
            s.dependency_capacity
        );
        tracing::info!(
            "  fairness:    window={}ms/{} buckets, weights={}/{}/{}",
            s.fairness_window_ms,
            s.fairness_buckets,
            s.priority_weights.low,
            s.priority_weights.normal,
            s.priority_weights.high
        );
        tracing::info!(
            "  hw wake-up:  listening={}, interval={}ms",
            s.hw_listening,
            s.hw_wakeup_interval_ms
        );
        tracing::info!("  log:         filter={}", self.log.filter);
    }

    /// Return a JSON view for dumps and diagnostics.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "scheduler": self.scheduler,
            "resolved_worker_threads": self.scheduler.resolved_worker_threads(),
            "log": { "filter": self.log.filter },
        })
    }
}

// ── Scheduler ─────────────────────────────────────────────────

/// Task scheduler configuration, typically parsed from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of worker threads. 0 = available parallelism.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Bounded number of task descriptor slots.
    #[serde(default = "default_task_pool_capacity")]
    pub task_pool_capacity: usize,
    /// Bounded number of dependency table entries.
    #[serde(default = "default_dependency_capacity")]
    pub dependency_capacity: usize,
    /// Maximum inputs, and separately maximum outputs, per task.
    #[serde(default = "default_max_task_dependencies")]
    pub max_task_dependencies: usize,
    /// Upper bound on an idle worker's sleep before it re-checks the queues.
    #[serde(default = "default_idle_wait_ms")]
    pub idle_wait_ms: u64,
    /// How long a `Busy` task is skipped when no hardware event arrives.
    #[serde(default = "default_busy_retry_ms")]
    pub busy_retry_ms: u64,
    /// Only worker 0 runs hardware-lane tasks.
    #[serde(default = "default_true")]
    pub dedicated_hardware_worker: bool,
    /// Start the hardware wake-up thread when the scheduler starts.
    #[serde(default = "default_true")]
    pub hw_listening: bool,
    /// Bounded wait of the wake-up thread between counter checks.
    #[serde(default = "default_hw_wakeup_interval_ms")]
    pub hw_wakeup_interval_ms: u64,
    /// Dedicated workers woken per hardware event.
    #[serde(default = "default_hw_wakeup_dedicated")]
    pub hw_wakeup_dedicated_workers: usize,
    /// Regular workers woken per hardware event.
    #[serde(default = "default_hw_wakeup_regular")]
    pub hw_wakeup_regular_workers: usize,
    /// Span of the rolling fairness window.
    #[serde(default = "default_fairness_window_ms")]
    pub fairness_window_ms: u64,
    /// Number of buckets the fairness window is split into.
    #[serde(default = "default_fairness_buckets")]
    pub fairness_buckets: usize,
    /// Share of CPU time each class may take, in percent.
    #[serde(default)]
    pub priority_weights: PriorityWeights,
}

fn default_worker_threads() -> usize { 0 }
fn default_task_pool_capacity() -> usize { 1024 }
fn default_dependency_capacity() -> usize { 2048 }
fn default_max_task_dependencies() -> usize { 8 }
fn default_idle_wait_ms() -> u64 { 1000 }
fn default_busy_retry_ms() -> u64 { 1 }
fn default_true() -> bool { true }
fn default_hw_wakeup_interval_ms() -> u64 { 1000 }
fn default_hw_wakeup_dedicated() -> usize { 1 }
fn default_hw_wakeup_regular() -> usize { 2 }
fn default_fairness_window_ms() -> u64 { 2000 }
fn default_fairness_buckets() -> usize { 4 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            task_pool_capacity: default_task_pool_capacity(),
            dependency_capacity: default_dependency_capacity(),
            max_task_dependencies: default_max_task_dependencies(),
            idle_wait_ms: default_idle_wait_ms(),
            busy_retry_ms: default_busy_retry_ms(),
            dedicated_hardware_worker: true,
            hw_listening: true,
            hw_wakeup_interval_ms: default_hw_wakeup_interval_ms(),
            hw_wakeup_dedicated_workers: default_hw_wakeup_dedicated(),
            hw_wakeup_regular_workers: default_hw_wakeup_regular(),
            fairness_window_ms: default_fairness_window_ms(),
            fairness_buckets: default_fairness_buckets(),
            priority_weights: PriorityWeights::default(),
        }
    }
}

impl SchedulerConfig {
    /// Resolve worker thread count (0 means use available parallelism).
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.worker_threads
        }
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    pub fn busy_retry(&self) -> Duration {
        Duration::from_millis(self.busy_retry_ms)
    }

    pub fn hw_wakeup_interval(&self) -> Duration {
        Duration::from_millis(self.hw_wakeup_interval_ms)
    }

    pub fn fairness_window(&self) -> Duration {
        Duration::from_millis(self.fairness_window_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.task_pool_capacity == 0 {
            return Err(ConfigError::Invalid("task_pool_capacity must be > 0".into()));
        }
        if self.task_pool_capacity > u32::MAX as usize {
            return Err(ConfigError::Invalid("task_pool_capacity exceeds u32 range".into()));
        }
        if self.dependency_capacity == 0 {
            return Err(ConfigError::Invalid("dependency_capacity must be > 0".into()));
        }
        if self.max_task_dependencies == 0 {
            return Err(ConfigError::Invalid("max_task_dependencies must be > 0".into()));
        }
        if self.fairness_buckets == 0 {
            return Err(ConfigError::Invalid("fairness_buckets must be > 0".into()));
        }
        if self.fairness_window_ms == 0 {
            return Err(ConfigError::Invalid("fairness_window_ms must be > 0".into()));
        }
        if self.idle_wait_ms == 0 {
            return Err(ConfigError::Invalid("idle_wait_ms must be > 0".into()));
        }
        Ok(())
    }

    fn apply_env_profiled(&mut self, p: &str) {
        override_from_env(p, "SCHED_WORKER_THREADS", &mut self.worker_threads);
        override_from_env(p, "SCHED_TASK_POOL_CAPACITY", &mut self.task_pool_capacity);
        override_from_env(p, "SCHED_DEPENDENCY_CAPACITY", &mut self.dependency_capacity);
        override_from_env(p, "SCHED_MAX_TASK_DEPENDENCIES", &mut self.max_task_dependencies);
        override_from_env(p, "SCHED_IDLE_WAIT_MS", &mut self.idle_wait_ms);
        override_from_env(p, "SCHED_BUSY_RETRY_MS", &mut self.busy_retry_ms);
        override_from_env(p, "SCHED_DEDICATED_HW_WORKER", &mut self.dedicated_hardware_worker);
        override_from_env(p, "SCHED_HW_LISTENING", &mut self.hw_listening);
        override_from_env(p, "SCHED_HW_WAKEUP_INTERVAL_MS", &mut self.hw_wakeup_interval_ms);
        override_from_env(p, "SCHED_HW_WAKEUP_DEDICATED", &mut self.hw_wakeup_dedicated_workers);
        override_from_env(p, "SCHED_HW_WAKEUP_REGULAR", &mut self.hw_wakeup_regular_workers);
        override_from_env(p, "SCHED_FAIRNESS_WINDOW_MS", &mut self.fairness_window_ms);
        override_from_env(p, "SCHED_FAIRNESS_BUCKETS", &mut self.fairness_buckets);
        override_from_env(p, "SCHED_WEIGHT_LOW", &mut self.priority_weights.low);
        override_from_env(p, "SCHED_WEIGHT_NORMAL", &mut self.priority_weights.normal);
        override_from_env(p, "SCHED_WEIGHT_HIGH", &mut self.priority_weights.high);
    }
}

/// Percent of CPU time each priority class may use out of the time spent by
/// that class and every class below it.
///
/// `Low` and `High` at 100 are never throttled; `Normal` at 75 yields to
/// `Low` once it has taken three quarters of their combined time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityWeights {
    #[serde(default = "default_weight_full")]
    pub low: u32,
    #[serde(default = "default_weight_normal")]
    pub normal: u32,
    #[serde(default = "default_weight_full")]
    pub high: u32,
}

fn default_weight_full() -> u32 { 100 }
fn default_weight_normal() -> u32 { 75 }

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            low: default_weight_full(),
            normal: default_weight_normal(),
            high: default_weight_full(),
        }
    }
}

impl PriorityWeights {
    pub fn for_priority(&self, priority: Priority) -> u32 {
        match priority {
            Priority::Low => self.low,
            Priority::Normal => self.normal,
            Priority::High => self.high,
        }
    }
}

// ── Logging ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info".into()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { filter: default_log_filter() }
    }
}

impl LogConfig {
    fn apply_env_profiled(&mut self, p: &str) {
        if let Some(filter) = profiled_env_opt(p, "LOG_FILTER") {
            self.filter = filter;
        }
    }
}
