//! Scheduler runner -- owns the worker threads and the shared task state.
//!
//! Split into focused submodules:
//! - `core`: Scheduler struct, constructor, worker wake-ups, shutdown, accessors
//! - `submit`: task admission and dependency wiring
//! - `scheduling`: ready-task selection (continuation, fairness passes, lanes)
//! - `execution`: the worker loop, entry point calls and completion cascade
//! - `sync`: blocking waits, owner teardown and recovery
//! - `wakeup`: hardware completion events and the wake-up thread

mod core;
mod execution;
mod scheduling;
mod submit;
mod sync;
mod wakeup;
#[cfg(test)]
mod tests;

pub use self::core::Scheduler;
