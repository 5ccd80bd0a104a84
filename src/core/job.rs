//! The job document.
//!
//! A [`Job`] is the unit of platform work tracked by the scheduler. It is
//! created by the submission path and afterwards only mutated through
//! store patches issued by the scheduler components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::state::JobState;
use super::types::{ExecutionId, JobId, OrganizationId, ProjectId, Tenant, UserId, WorkspaceId};

/// Cancellation request recorded on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationInfo {
    /// A cancellation has been requested.
    pub is_cancelled: bool,
    /// The job accepts cancellation requests at all.
    pub cancellable: bool,
    /// Who requested the cancellation.
    pub user_id: Option<UserId>,
    /// When the cancellation was requested.
    pub cancel_time: Option<DateTime<Utc>>,
}

impl Default for CancellationInfo {
    fn default() -> Self {
        Self {
            is_cancelled: false,
            cancellable: true,
            user_id: None,
            cancel_time: None,
        }
    }
}

/// Requested amount of a billable resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostRequest {
    pub amount: i64,
    pub unit: String,
}

/// Consumed amount of a billable resource, reported by the running workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumedCost {
    pub amount: i64,
    pub unit: String,
    pub consumed_at: DateTime<Utc>,
    pub service: String,
}

/// Cost accounting of a job. Consumed entries are append-only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cost {
    pub requests: Vec<CostRequest>,
    pub consumed: Vec<ConsumedCost>,
}

/// Which workflow of a job an execution belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    /// The job's own workflow.
    Main,
    /// The compensating workflow.
    Revert,
}

impl ExecutionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionKind::Main => "main",
            ExecutionKind::Revert => "revert",
        }
    }
}

impl fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bookkeeping for one external execution of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    /// Handle of the external execution, once started.
    pub execution_id: Option<ExecutionId>,
    /// Failed attempts to start the execution.
    pub start_retry_counter: u32,
    /// Identifier of the launch plan the execution was started from.
    pub flyte_launch_plan_id: Option<String>,
    /// Error of the most recent failed start attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_start_error: Option<String>,
    /// When a scheduler instance last locked the job to start this execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
}

/// Main and revert execution bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Executions {
    pub main: ExecutionInfo,
    pub revert: ExecutionInfo,
}

impl Executions {
    pub fn get(&self, kind: ExecutionKind) -> &ExecutionInfo {
        match kind {
            ExecutionKind::Main => &self.main,
            ExecutionKind::Revert => &self.revert,
        }
    }

    pub fn get_mut(&mut self, kind: ExecutionKind) -> &mut ExecutionInfo {
        match kind {
            ExecutionKind::Main => &mut self.main,
            ExecutionKind::Revert => &mut self.revert,
        }
    }
}

/// State of a single workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Waiting,
    Running,
    Finished,
    Failed,
    Skipped,
}

/// Progress value of a step that has not started.
pub const PROGRESS_NOT_STARTED: f64 = -1.0;

/// Progress breakdown entry for one workflow step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDetail {
    pub index: u32,
    pub task_id: String,
    pub step_name: String,
    pub state: StepState,
    /// Percentage in `0..=100`, or [`PROGRESS_NOT_STARTED`].
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branches: Option<Vec<StepBranch>>,
    /// Duration of the step in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl StepDetail {
    /// A step that has not started yet.
    pub fn waiting(index: u32, task_id: impl Into<String>, step_name: impl Into<String>) -> Self {
        Self {
            index,
            task_id: task_id.into(),
            step_name: step_name.into(),
            state: StepState::Waiting,
            progress: PROGRESS_NOT_STARTED,
            branches: None,
            duration: None,
            warning: None,
        }
    }

    fn find_mut(&mut self, index: u32) -> Option<&mut StepDetail> {
        if self.index == index {
            return Some(self);
        }
        self.branches
            .as_mut()?
            .iter_mut()
            .flat_map(|b| b.branch.iter_mut())
            .find_map(|s| s.find_mut(index))
    }
}

/// Conditional downstream steps of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepBranch {
    pub condition: String,
    pub branch: Vec<StepDetail>,
}

/// Progress report for a single step, as sent by the running workload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepProgress {
    pub index: u32,
    #[serde(default)]
    pub state: Option<StepState>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub warning: Option<String>,
}

/// Where a terminal failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureOrigin {
    /// The job's workflow itself failed.
    Workflow,
    /// The platform could not run the workflow.
    Platform,
}

/// Diagnostics retained on a failed or cancelled job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub origin: FailureOrigin,
    pub step_name: Option<String>,
    pub message: String,
}

impl FailureInfo {
    pub fn platform(message: impl Into<String>) -> Self {
        Self {
            origin: FailureOrigin::Platform,
            step_name: None,
            message: message.into(),
        }
    }

    pub fn workflow(step_name: Option<String>, message: impl Into<String>) -> Self {
        Self {
            origin: FailureOrigin::Workflow,
            step_name,
            message: message.into(),
        }
    }
}

/// A job document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub organization_id: OrganizationId,
    pub workspace_id: WorkspaceId,
    #[serde(default)]
    pub project_id: Option<ProjectId>,
    /// Determines the workflow template and admission policy.
    #[serde(rename = "type")]
    pub job_type: String,
    /// De-duplication key.
    pub key: String,
    pub state: JobState,
    /// Higher values are scheduled first.
    pub priority: i32,
    pub creation_time: DateTime<Utc>,
    #[serde(default)]
    pub author: Option<UserId>,
    /// Input handed to the workflow execution.
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub cancellation_info: CancellationInfo,
    #[serde(default)]
    pub cost: Cost,
    #[serde(default)]
    pub executions: Executions,
    #[serde(default)]
    pub step_details: Vec<StepDetail>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub gpu_reserved: bool,
    #[serde(default)]
    pub failure: Option<FailureInfo>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a submitted job with default priority.
    pub fn new(job_type: impl Into<String>, key: impl Into<String>, tenant: Tenant) -> Self {
        Self {
            id: JobId::generate(),
            organization_id: tenant.organization_id,
            workspace_id: tenant.workspace_id,
            project_id: None,
            job_type: job_type.into(),
            key: key.into(),
            state: JobState::Submitted,
            priority: 0,
            creation_time: Utc::now(),
            author: None,
            payload: Value::Null,
            cancellation_info: CancellationInfo::default(),
            cost: Cost::default(),
            executions: Executions::default(),
            step_details: Vec::new(),
            metadata: Map::new(),
            gpu_reserved: false,
            failure: None,
            start_time: None,
            end_time: None,
        }
    }

    /// Set the job id.
    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the state.
    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = state;
        self
    }

    /// Set the creation time.
    pub fn with_creation_time(mut self, creation_time: DateTime<Utc>) -> Self {
        self.creation_time = creation_time;
        self
    }

    /// Set the project.
    pub fn with_project(mut self, project_id: impl Into<ProjectId>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Set the workflow payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set the author.
    pub fn with_author(mut self, author: impl Into<UserId>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// Set whether the job accepts cancellation.
    pub fn with_cancellable(mut self, cancellable: bool) -> Self {
        self.cancellation_info.cancellable = cancellable;
        self
    }

    /// Set the cost requests.
    pub fn with_cost_requests(mut self, requests: Vec<CostRequest>) -> Self {
        self.cost.requests = requests;
        self
    }

    pub fn tenant(&self) -> Tenant {
        Tenant::new(self.organization_id.clone(), self.workspace_id.clone())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_info.is_cancelled
    }

    pub fn execution(&self, kind: ExecutionKind) -> &ExecutionInfo {
        self.executions.get(kind)
    }

    /// Merge step progress reports into the step breakdown.
    ///
    /// Reports for unknown step indices are ignored.
    pub fn merge_step_progress(&mut self, updates: &[StepProgress]) {
        for update in updates {
            let Some(step) = self
                .step_details
                .iter_mut()
                .find_map(|s| s.find_mut(update.index))
            else {
                continue;
            };
            if let Some(state) = update.state {
                step.state = state;
            }
            if let Some(progress) = update.progress {
                step.progress = progress.clamp(PROGRESS_NOT_STARTED, 100.0);
            }
            if let Some(duration) = update.duration {
                step.duration = Some(duration);
            }
            if let Some(warning) = &update.warning {
                step.warning = Some(warning.clone());
            }
        }
    }

    /// Name of the first failed step, if any.
    pub fn failed_step_name(&self) -> Option<String> {
        self.step_details
            .iter()
            .find(|s| s.state == StepState::Failed)
            .map(|s| s.step_name.clone())
    }
}
