//! External workflow engine interface.
//!
//! The scheduler never talks to the orchestration engine directly; it goes
//! through the [`WorkflowEngine`] trait so the Flyte client can be replaced
//! by a fake in tests.

mod flyte;

pub use flyte::FlyteAdminClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::core::job::Job;
use crate::core::types::{ExecutionId, JobId, OrganizationId, ProjectId, UserId, WorkspaceId};

/// Errors returned by a workflow engine.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The engine could not be reached.
    #[error("workflow engine unavailable: {0}")]
    Unavailable(String),

    /// The engine refused the request.
    #[error("workflow engine rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The engine answered with something we could not interpret.
    #[error("invalid workflow engine response: {0}")]
    InvalidResponse(String),
}

/// A deployable workflow (a Flyte launch plan).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDef {
    pub name: String,
    pub version: String,
    /// Engine-side identifier of the launch plan.
    pub launch_plan_id: String,
}

/// Coarse phase of an external execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Queued,
    Running,
    Succeeded,
    Failed,
    Aborted,
    Unknown,
}

impl ExecutionPhase {
    /// Whether the execution has stopped running.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            ExecutionPhase::Succeeded | ExecutionPhase::Failed | ExecutionPhase::Aborted
        )
    }
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionPhase::Queued => "queued",
            ExecutionPhase::Running => "running",
            ExecutionPhase::Succeeded => "succeeded",
            ExecutionPhase::Failed => "failed",
            ExecutionPhase::Aborted => "aborted",
            ExecutionPhase::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Handle of an execution known to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionHandle {
    /// Execution name, unique within the engine project.
    pub execution_id: ExecutionId,
    pub phase: ExecutionPhase,
}

/// Tenant and telemetry context attached to a started execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    pub job_id: JobId,
    pub organization_id: OrganizationId,
    pub workspace_id: WorkspaceId,
    pub project_id: Option<ProjectId>,
    pub author: Option<UserId>,
    /// Trace/session identifier propagated to the workload.
    pub session_id: String,
}

impl TenantContext {
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            organization_id: job.organization_id.clone(),
            workspace_id: job.workspace_id.clone(),
            project_id: job.project_id.clone(),
            author: job.author.clone(),
            session_id: job.id.to_string(),
        }
    }
}

/// Request to start a new execution.
#[derive(Debug, Clone, PartialEq)]
pub struct StartRequest {
    pub workflow: WorkflowDef,
    pub execution_id: ExecutionId,
    pub payload: Value,
    pub tenant: TenantContext,
}

/// Client of the external workflow engine.
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    /// Look up a workflow definition; `None` if it does not exist.
    async fn fetch_workflow(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<WorkflowDef>, WorkflowError>;

    /// Look up an execution by name; `None` if it does not exist.
    async fn fetch_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<ExecutionHandle>, WorkflowError>;

    /// Start a new execution.
    async fn start_execution(&self, request: StartRequest) -> Result<ExecutionHandle, WorkflowError>;

    /// Return the subset of the named executions that exist.
    async fn list_executions(
        &self,
        execution_ids: &[ExecutionId],
    ) -> Result<Vec<ExecutionHandle>, WorkflowError>;
}
