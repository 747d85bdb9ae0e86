use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, warn};

use crate::scheduler::task::SchedError;

use super::core::{lock_unpoisoned, Inner};
use super::Scheduler;

impl Scheduler {
    /// Report one hardware completion event.
    ///
    /// Safe to call from any thread, including driver callbacks. Tasks
    /// parked after returning `Busy` become eligible again, and the wake-up
    /// thread (if listening) rouses idle workers to retry them.
    pub fn signal_hw_event(&self) {
        self.inner.hw_counter.fetch_add(1, Ordering::AcqRel);
        let _hw = lock_unpoisoned(&self.inner.hw);
        self.inner.hw_wake.notify_one();
    }

    /// Whether the wake-up thread is running.
    pub fn is_hw_listening(&self) -> bool {
        lock_unpoisoned(&self.threads).wakeup.is_some()
    }

    /// Start the wake-up thread. No-op if it is already running.
    pub fn start_hw_listening(&self) -> Result<(), SchedError> {
        let mut threads = lock_unpoisoned(&self.threads);
        if threads.wakeup.is_some() {
            return Ok(());
        }
        lock_unpoisoned(&self.inner.hw).stop = false;

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("hwsched-wakeup".to_string())
            .spawn(move || inner.wakeup_loop())?;
        threads.wakeup = Some(handle);
        info!("Hardware listening started");
        Ok(())
    }

    /// Stop and join the wake-up thread. No-op if it is not running.
    /// Busy tasks are still retried every `busy_retry_ms`.
    pub fn stop_hw_listening(&self) {
        let handle = lock_unpoisoned(&self.threads).wakeup.take();
        let Some(handle) = handle else {
            return;
        };
        {
            let mut hw = lock_unpoisoned(&self.inner.hw);
            hw.stop = true;
            self.inner.hw_wake.notify_all();
        }
        if handle.join().is_err() {
            warn!("wake-up thread panicked");
        }
        info!("Hardware listening stopped");
    }
}

impl Inner {
    /// Turn hardware counter increments into worker wake-ups. Never runs
    /// entry points.
    fn wakeup_loop(&self) {
        let interval = self.config.hw_wakeup_interval();
        let mut seen = self.hw_counter.load(Ordering::Acquire);

        loop {
            {
                let hw = lock_unpoisoned(&self.hw);
                let (hw, _) = self
                    .hw_wake
                    .wait_timeout_while(hw, interval, |state| {
                        !state.stop && self.hw_counter.load(Ordering::Acquire) == seen
                    })
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if hw.stop {
                    break;
                }
            }

            let now = self.hw_counter.load(Ordering::Acquire);
            if now == seen {
                continue;
            }
            seen = now;

            let mut core = self.lock_core();
            if core.shut_down {
                break;
            }
            let woken = self.wake_workers(
                &mut core,
                self.config.hw_wakeup_dedicated_workers,
                self.config.hw_wakeup_regular_workers,
            );
            debug!(hw_events = now, woken, "hardware event");
        }
    }
}
