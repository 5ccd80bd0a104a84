//! Job lifecycle states and the legal transition graph.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted but not yet visible to the scheduler.
    Pending,
    /// Waiting for admission.
    Submitted,
    /// Admitted, waiting for a scheduler instance to lock it.
    ReadyForScheduling,
    /// Locked by a scheduler instance while its execution is started.
    Scheduling,
    /// External execution started.
    Scheduled,
    /// External execution reported progress.
    Running,
    /// Waiting for the compensating workflow to be started.
    ReadyForRevert,
    /// Locked by a scheduler instance while the revert execution is started.
    RevertScheduling,
    /// Revert execution started.
    RevertScheduled,
    /// Revert execution reported progress.
    Reverting,
    /// Finished successfully.
    Done,
    /// Finished with an error.
    Failed,
    /// Finished after a cancellation request.
    Cancelled,
}

/// States counted against running-job limits.
pub const ADMITTED_STATES: [JobState; 4] = [
    JobState::ReadyForScheduling,
    JobState::Scheduling,
    JobState::Scheduled,
    JobState::Running,
];

/// States of jobs that hold their de-duplication key.
pub const IN_FLIGHT_STATES: [JobState; 8] = [
    JobState::ReadyForScheduling,
    JobState::Scheduling,
    JobState::Scheduled,
    JobState::Running,
    JobState::ReadyForRevert,
    JobState::RevertScheduling,
    JobState::RevertScheduled,
    JobState::Reverting,
];

/// States whose main execution must be alive in the workflow engine.
pub const MAIN_EXECUTION_STATES: [JobState; 2] = [JobState::Scheduled, JobState::Running];

/// States whose revert execution must be alive in the workflow engine.
pub const REVERT_EXECUTION_STATES: [JobState; 2] =
    [JobState::RevertScheduled, JobState::Reverting];

/// Every non-terminal state.
pub const NON_TERMINAL_STATES: [JobState; 10] = [
    JobState::Pending,
    JobState::Submitted,
    JobState::ReadyForScheduling,
    JobState::Scheduling,
    JobState::Scheduled,
    JobState::Running,
    JobState::ReadyForRevert,
    JobState::RevertScheduling,
    JobState::RevertScheduled,
    JobState::Reverting,
];

impl JobState {
    /// Stable string form used in storage and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Submitted => "submitted",
            JobState::ReadyForScheduling => "ready_for_scheduling",
            JobState::Scheduling => "scheduling",
            JobState::Scheduled => "scheduled",
            JobState::Running => "running",
            JobState::ReadyForRevert => "ready_for_revert",
            JobState::RevertScheduling => "revert_scheduling",
            JobState::RevertScheduled => "revert_scheduled",
            JobState::Reverting => "reverting",
            JobState::Done => "done",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    /// Whether the job has finished for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Cancelled)
    }

    /// Whether the job holds its key against other jobs.
    pub fn is_in_flight(&self) -> bool {
        IN_FLIGHT_STATES.contains(self)
    }

    /// Whether the job has not started any external work yet.
    ///
    /// A cancellation request finishes such jobs immediately.
    pub fn is_before_execution(&self) -> bool {
        matches!(
            self,
            JobState::Pending | JobState::Submitted | JobState::ReadyForScheduling
        )
    }

    /// Whether moving from `self` to `next` is an edge of the lifecycle graph.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        match self {
            Pending => matches!(next, Submitted | Cancelled),
            Submitted => matches!(next, ReadyForScheduling | Cancelled),
            ReadyForScheduling => matches!(next, Scheduling | Cancelled),
            Scheduling => matches!(next, Scheduled | ReadyForScheduling | Failed | Cancelled),
            Scheduled | Running => matches!(
                next,
                Running | Done | Failed | Cancelled | ReadyForRevert | Submitted
            ),
            ReadyForRevert => matches!(next, RevertScheduling),
            RevertScheduling => {
                matches!(next, RevertScheduled | ReadyForRevert | Failed | Cancelled)
            }
            RevertScheduled | Reverting => {
                matches!(next, Reverting | Failed | Cancelled | ReadyForRevert)
            }
            Done | Failed | Cancelled => false,
        }
    }

    /// Whether `self -> next` is the recovery reset edge.
    pub fn is_recovery_reset(&self, next: JobState) -> bool {
        (MAIN_EXECUTION_STATES.contains(self) && next == JobState::Submitted)
            || (REVERT_EXECUTION_STATES.contains(self) && next == JobState::ReadyForRevert)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use JobState::*;
        let state = match s {
            "pending" => Pending,
            "submitted" => Submitted,
            "ready_for_scheduling" => ReadyForScheduling,
            "scheduling" => Scheduling,
            "scheduled" => Scheduled,
            "running" => Running,
            "ready_for_revert" => ReadyForRevert,
            "revert_scheduling" => RevertScheduling,
            "revert_scheduled" => RevertScheduled,
            "reverting" => Reverting,
            "done" => Done,
            "failed" => Failed,
            "cancelled" => Cancelled,
            other => return Err(format!("unknown job state: {}", other)),
        };
        Ok(state)
    }
}
