//! API request and response types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::job::{FailureInfo, Job, StepDetail, StepProgress};
use crate::core::state::JobState;
use crate::lifecycle::{CancelOutcome, Completion};
use crate::scheduler::{Cycle, CycleReport, SchedulerState};

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Scheduler state response.
#[derive(Debug, Serialize)]
pub struct SchedulerStateResponse {
    pub state: SchedulerState,
    pub is_running: bool,
    pub is_paused: bool,
}

impl From<SchedulerState> for SchedulerStateResponse {
    fn from(state: SchedulerState) -> Self {
        Self {
            state,
            is_running: state == SchedulerState::Running,
            is_paused: state == SchedulerState::Paused,
        }
    }
}

/// Job view returned by the inspection endpoints.
#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub key: String,
    pub state: JobState,
    pub priority: i32,
    pub organization_id: String,
    pub workspace_id: String,
    pub is_cancelled: bool,
    pub gpu_reserved: bool,
    pub main_execution_id: Option<String>,
    pub revert_execution_id: Option<String>,
    pub step_details: Vec<StepDetail>,
    pub failure: Option<FailureInfo>,
    pub creation_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl From<&Job> for JobResponse {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.to_string(),
            job_type: job.job_type.clone(),
            key: job.key.clone(),
            state: job.state,
            priority: job.priority,
            organization_id: job.organization_id.to_string(),
            workspace_id: job.workspace_id.to_string(),
            is_cancelled: job.is_cancelled(),
            gpu_reserved: job.gpu_reserved,
            main_execution_id: job.executions.main.execution_id.as_ref().map(|id| id.to_string()),
            revert_execution_id: job
                .executions
                .revert
                .execution_id
                .as_ref()
                .map(|id| id.to_string()),
            step_details: job.step_details.clone(),
            failure: job.failure.clone(),
            creation_time: job.creation_time,
            start_time: job.start_time,
            end_time: job.end_time,
        }
    }
}

/// List of jobs response.
#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
    pub count: usize,
}

/// Result of a cancellation request.
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: String,
    /// `cancelled`, `flagged` or `unchanged`.
    pub outcome: &'static str,
    pub state: JobState,
}

impl CancelResponse {
    pub fn new(job_id: impl Into<String>, outcome: CancelOutcome) -> Self {
        let (outcome, state) = match outcome {
            CancelOutcome::Cancelled => ("cancelled", JobState::Cancelled),
            CancelOutcome::Flagged(state) => ("flagged", state),
            CancelOutcome::Unchanged(state) => ("unchanged", state),
        };
        Self {
            job_id: job_id.into(),
            outcome,
            state,
        }
    }
}

/// Acknowledgement of an applied update.
#[derive(Debug, Serialize)]
pub struct UpdateResponse {
    pub job_id: String,
    pub execution_id: String,
}

/// State of a job after a progress or completion report.
#[derive(Debug, Serialize)]
pub struct ReportResponse {
    pub execution_id: String,
    pub state: JobState,
}

/// Body of a progress report.
#[derive(Debug, Deserialize)]
pub struct ProgressRequest {
    #[serde(default)]
    pub steps: Vec<StepProgress>,
}

/// Body of a completion report.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CompletionRequest {
    Success,
    Failure {
        #[serde(default)]
        message: String,
    },
}

impl From<CompletionRequest> for Completion {
    fn from(request: CompletionRequest) -> Self {
        match request {
            CompletionRequest::Success => Completion::Success,
            CompletionRequest::Failure { message } => Completion::Failure { message },
        }
    }
}

/// Result of a manually triggered cycle.
#[derive(Debug, Serialize)]
pub struct RunCycleResponse {
    pub cycle: Cycle,
    pub affected: usize,
}

impl From<(Cycle, &CycleReport)> for RunCycleResponse {
    fn from((cycle, report): (Cycle, &CycleReport)) -> Self {
        Self {
            cycle,
            affected: report.affected(),
        }
    }
}

/// Simple message response.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}
