//! Scheduler type definitions.
//!
//! This module contains error types, state enums, and command types for the scheduler.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::execution::{DriverError, ScheduleOutcome};
use crate::policy::AdmissionReport;
use crate::recovery::RecoveryReport;
use crate::storage::StorageError;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Execution driver error.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// Channel error.
    #[error("channel error: {0}")]
    ChannelError(String),

    /// Unknown cycle name.
    #[error("unknown cycle: {0}")]
    UnknownCycle(String),
}

/// State of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    /// Scheduler is stopped.
    Stopped,
    /// Scheduler is running.
    Running,
    /// Scheduler is paused.
    Paused,
}

/// One of the periodic scheduler cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Cycle {
    Admission,
    Scheduling,
    Revert,
    Recovery,
}

impl Cycle {
    pub const ALL: [Cycle; 4] = [
        Cycle::Admission,
        Cycle::Scheduling,
        Cycle::Revert,
        Cycle::Recovery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Cycle::Admission => "admission",
            Cycle::Scheduling => "scheduling",
            Cycle::Revert => "revert",
            Cycle::Recovery => "recovery",
        }
    }
}

impl fmt::Display for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cycle {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cycle::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SchedulerError::UnknownCycle(s.to_string()))
    }
}

/// Result of one cycle run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleReport {
    Admission(AdmissionReport),
    Scheduling(Vec<ScheduleOutcome>),
    Revert(Vec<ScheduleOutcome>),
    Recovery(RecoveryReport),
}

impl CycleReport {
    /// Number of jobs the cycle changed.
    pub fn affected(&self) -> usize {
        match self {
            CycleReport::Admission(report) => report.promoted.len(),
            CycleReport::Scheduling(outcomes) | CycleReport::Revert(outcomes) => outcomes
                .iter()
                .filter(|o| !matches!(o, ScheduleOutcome::Idle | ScheduleOutcome::LostRace { .. }))
                .count(),
            CycleReport::Recovery(report) => report.reset.len() + report.released.len(),
        }
    }
}

/// Requests carried from a handle to the scheduler loop.
pub(crate) enum SchedulerCommand {
    RunNow {
        cycle: Cycle,
        reply: oneshot::Sender<Result<CycleReport, SchedulerError>>,
    },
    /// Pause, resume or stop; the reply is the previous state.
    SetState {
        target: SchedulerState,
        reply: oneshot::Sender<SchedulerState>,
    },
}
