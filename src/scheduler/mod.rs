//! Scheduler supervisor.
//!
//! This module runs the admission, scheduling, revert and recovery cycles
//! on their own timers and exposes a handle to pause, resume, trigger and
//! stop them.

mod engine;
mod handle;
mod types;

pub use engine::Scheduler;
pub use handle::SchedulerHandle;
pub use types::{Cycle, CycleReport, SchedulerError, SchedulerState};
