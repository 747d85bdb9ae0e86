//! sched-worker: drives the scheduler with synthetic transcode sessions.
//!
//! Each session submits, per frame, a decode (hardware lane, high priority),
//! a VPP pass (software lane, normal priority), an encode (hardware lane,
//! high priority) and a low-priority analysis task, chained through
//! dependency keys. A simulated GPU thread completes hardware jobs after a
//! fixed latency and reports each completion with `signal_hw_event`.
//!
//! At the end the scheduler metrics are printed as JSON.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use serde::Serialize;
use tracing::{error, info, warn};

use hwsched::{
    Config, DependencyKey, EntryPoint, Lane, OwnerId, Priority, SchedError, Scheduler,
    TaskDescriptor, TaskStatus,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Synthetic decode → VPP → encode load for the task scheduler.
#[derive(Parser, Debug)]
#[command(name = "sched-worker", version, about)]
struct Cli {
    /// Path to a TOML config file. Falls back to env-based config.
    #[arg(long, env = "HWSCHED_CONFIG")]
    config: Option<String>,

    /// Number of concurrent transcode sessions.
    #[arg(long, default_value_t = 4)]
    sessions: usize,

    /// Frames per session.
    #[arg(long, default_value_t = 30)]
    frames: u32,

    /// Frames in flight per session before the oldest encode is awaited.
    #[arg(long, default_value_t = 4)]
    depth: usize,

    /// Make session 0's decode fail at this frame.
    #[arg(long)]
    fail_frame: Option<u32>,

    /// Simulated hardware latency per job, in milliseconds.
    #[arg(long, default_value_t = 2)]
    hw_latency_ms: u64,

    /// Per-wait timeout when synchronizing an encode, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,
}

// ── Simulated hardware ──────────────────────────────────────────────

/// A GPU stand-in: jobs complete after a fixed latency, each completion is
/// reported to the scheduler as a hardware event.
struct HwSim {
    latency: Duration,
    jobs: Mutex<Vec<(Instant, Arc<AtomicBool>)>>,
    completed: AtomicU64,
}

impl HwSim {
    fn new(latency: Duration) -> Self {
        Self {
            latency,
            jobs: Mutex::new(Vec::new()),
            completed: AtomicU64::new(0),
        }
    }

    fn submit(&self) -> Arc<AtomicBool> {
        let done = Arc::new(AtomicBool::new(false));
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.push((Instant::now() + self.latency, Arc::clone(&done)));
        }
        done
    }

    /// Complete due jobs until `stop` is set.
    fn run(&self, scheduler: &Scheduler, stop: &AtomicBool) {
        while !stop.load(Ordering::Acquire) {
            let now = Instant::now();
            let finished = match self.jobs.lock() {
                Ok(mut jobs) => {
                    let before = jobs.len();
                    jobs.retain(|(due, done)| {
                        if *due <= now {
                            done.store(true, Ordering::Release);
                            false
                        } else {
                            true
                        }
                    });
                    before - jobs.len()
                }
                Err(_) => 0,
            };
            for _ in 0..finished {
                self.completed.fetch_add(1, Ordering::Relaxed);
                scheduler.signal_hw_event();
            }
            thread::sleep(Duration::from_micros(500));
        }
    }
}

/// Hardware stage: first call kicks off a job and reports `Busy` until the
/// simulated GPU completes it.
struct HwStage {
    name: String,
    hw: Arc<HwSim>,
    job: Mutex<Option<Arc<AtomicBool>>>,
    fail: bool,
}

impl EntryPoint for HwStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, _worker: usize, _call_number: u32) -> TaskStatus {
        if self.fail {
            return TaskStatus::Failed(-1);
        }
        let Ok(mut job) = self.job.lock() else {
            return TaskStatus::Failed(-2);
        };
        match job.as_ref() {
            None => {
                *job = Some(self.hw.submit());
                TaskStatus::Busy
            }
            Some(done) if done.load(Ordering::Acquire) => TaskStatus::Done,
            Some(_) => TaskStatus::Busy,
        }
    }
}

/// Software stage: burns a little CPU over `passes` calls.
fn cpu_stage(name: &str, passes: u32, spin: u32) -> TaskDescriptor {
    TaskDescriptor::from_fn(name, move |_worker, call| {
        let mut acc = 0u64;
        for i in 0..spin {
            acc = acc.wrapping_mul(31).wrapping_add(u64::from(i));
        }
        std::hint::black_box(acc);
        if call + 1 < passes {
            TaskStatus::Continue
        } else {
            TaskStatus::Done
        }
    })
}

// ── Sessions ────────────────────────────────────────────────────────

/// Frames between session drains.
const GOP_LENGTH: u32 = 32;

#[derive(Debug, Default, Serialize)]
struct SessionReport {
    session: usize,
    frames_ok: u32,
    frames_failed: u32,
    timeouts: u32,
}

fn frame_key(session: usize, frame: u32, stage: u64) -> DependencyKey {
    DependencyKey::new(((session as u64) << 40) | (u64::from(frame) << 8) | stage)
}

fn submit_frame(
    scheduler: &Scheduler,
    hw: &Arc<HwSim>,
    owner: OwnerId,
    session: usize,
    frame: u32,
    fail: bool,
) -> Result<hwsched::SyncHandle, SchedError> {
    let decoded = frame_key(session, frame, 1);
    let processed = frame_key(session, frame, 2);
    let bitstream = frame_key(session, frame, 3);

    let decode = HwStage {
        name: "decode".to_string(),
        hw: Arc::clone(hw),
        job: Mutex::new(None),
        fail,
    };
    scheduler.submit(
        TaskDescriptor::new(Arc::new(decode))
            .priority(Priority::High)
            .lane(Lane::Hardware)
            .owner(owner)
            .output(decoded),
    )?;

    scheduler.submit(
        cpu_stage("vpp", 2, 50_000)
            .priority(Priority::Normal)
            .owner(owner)
            .input(decoded)
            .output(processed),
    )?;

    let encode = HwStage {
        name: "encode".to_string(),
        hw: Arc::clone(hw),
        job: Mutex::new(None),
        fail: false,
    };
    let encode = scheduler.submit(
        TaskDescriptor::new(Arc::new(encode))
            .priority(Priority::High)
            .lane(Lane::Hardware)
            .owner(owner)
            .input(processed)
            .output(bitstream),
    )?;

    scheduler.submit(
        cpu_stage("analysis", 1, 20_000)
            .priority(Priority::Low)
            .owner(owner)
            .input(processed),
    )?;

    Ok(encode)
}

fn await_encode(
    scheduler: &Scheduler,
    handle: hwsched::SyncHandle,
    timeout: Duration,
    report: &mut SessionReport,
) {
    loop {
        match scheduler.synchronize(handle, Some(timeout)) {
            Ok(()) => {
                report.frames_ok += 1;
                return;
            }
            Err(SchedError::Timeout(_)) => {
                report.timeouts += 1;
                warn!(session = report.session, %handle, "encode still pending");
            }
            Err(e) => {
                report.frames_failed += 1;
                warn!(session = report.session, %handle, error = %e, "frame failed");
                return;
            }
        }
    }
}

fn run_session(
    scheduler: &Scheduler,
    hw: &Arc<HwSim>,
    cli: &Cli,
    session: usize,
) -> Result<SessionReport, SchedError> {
    let owner = OwnerId::new();
    let timeout = Duration::from_millis(cli.timeout_ms);
    let mut report = SessionReport {
        session,
        ..SessionReport::default()
    };
    let mut in_flight = VecDeque::new();

    for frame in 0..cli.frames {
        let fail = session == 0 && cli.fail_frame == Some(frame);
        let encode = submit_frame(scheduler, hw, owner, session, frame, fail)?;
        in_flight.push_back(encode);
        if in_flight.len() > cli.depth {
            if let Some(oldest) = in_flight.pop_front() {
                await_encode(scheduler, oldest, timeout, &mut report);
            }
        }

        // Only encodes are synchronized; the other stages' slots are
        // reclaimed by draining the session at each GOP boundary.
        if frame % GOP_LENGTH == GOP_LENGTH - 1 {
            while let Some(handle) = in_flight.pop_front() {
                await_encode(scheduler, handle, timeout, &mut report);
            }
            scheduler.wait_for_all_tasks_completion(owner);
        }
    }
    while let Some(handle) = in_flight.pop_front() {
        await_encode(scheduler, handle, timeout, &mut report);
    }

    scheduler.wait_for_all_tasks_completion(owner);
    info!(
        session,
        %owner,
        ok = report.frames_ok,
        failed = report.frames_failed,
        "session finished"
    );
    Ok(report)
}

// ── Main ────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    hwsched_core::config::load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(cfg) => {
                info!(path = %path, "loaded scheduler config");
                cfg
            }
            Err(e) => {
                warn!(error = %e, path = %path, "failed to load config, using env defaults");
                Config::from_env()
            }
        },
        None => Config::from_env(),
    };
    config.log_summary();

    let scheduler = Arc::new(Scheduler::from_config(&config)?);
    let hw = Arc::new(HwSim::new(Duration::from_millis(cli.hw_latency_ms)));
    let stop = Arc::new(AtomicBool::new(false));

    let gpu = {
        let scheduler = Arc::clone(&scheduler);
        let hw = Arc::clone(&hw);
        let stop = Arc::clone(&stop);
        thread::Builder::new()
            .name("gpu-sim".to_string())
            .spawn(move || hw.run(&scheduler, &stop))?
    };

    let started = Instant::now();
    let reports: Vec<SessionReport> = thread::scope(|scope| {
        let handles: Vec<_> = (0..cli.sessions)
            .map(|session| {
                let scheduler = &scheduler;
                let hw = &hw;
                let cli = &cli;
                scope.spawn(move || run_session(scheduler, hw, cli, session))
            })
            .collect();

        handles
            .into_iter()
            .filter_map(|h| match h.join() {
                Ok(Ok(report)) => Some(report),
                Ok(Err(e)) => {
                    error!(error = %e, "session aborted");
                    None
                }
                Err(_) => {
                    error!("session thread panicked");
                    None
                }
            })
            .collect()
    });
    let elapsed = started.elapsed();

    stop.store(true, Ordering::Release);
    if gpu.join().is_err() {
        error!("gpu-sim thread panicked");
    }

    let state = scheduler.state();
    if state != hwsched::SchedulerState::Running {
        info!(?state, "resetting scheduler after failed frames");
        scheduler.reset();
    }

    let summary = serde_json::json!({
        "elapsed_ms": elapsed.as_millis() as u64,
        "hw_jobs": hw.completed.load(Ordering::Relaxed),
        "sessions": reports,
        "metrics": scheduler.metrics(),
        "config": config.summary(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    scheduler.shutdown();
    Ok(())
}
