//! Flyte Admin REST client.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use super::{
    ExecutionHandle, ExecutionPhase, StartRequest, WorkflowDef, WorkflowEngine, WorkflowError,
};
use crate::core::types::ExecutionId;

/// Request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Workflow engine backed by the Flyte Admin service.
///
/// Workflows are resolved as launch plans of the configured project and
/// domain; executions are addressed by name within the same scope.
pub struct FlyteAdminClient {
    client: Client,
    endpoint: String,
    project: String,
    domain: String,
}

#[derive(Debug, Deserialize)]
struct Identifier {
    project: String,
    domain: String,
    name: String,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LaunchPlanResponse {
    id: Identifier,
}

#[derive(Debug, Default, Deserialize)]
struct ExecutionClosure {
    #[serde(default)]
    phase: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecutionResponse {
    id: Identifier,
    #[serde(default)]
    closure: ExecutionClosure,
}

#[derive(Debug, Deserialize)]
struct ExecutionListResponse {
    #[serde(default)]
    executions: Vec<ExecutionResponse>,
}

#[derive(Debug, Deserialize)]
struct CreateExecutionResponse {
    id: Identifier,
}

fn parse_phase(phase: Option<&str>) -> ExecutionPhase {
    match phase {
        Some("QUEUED") | Some("UNDEFINED") | None => ExecutionPhase::Queued,
        Some("RUNNING") | Some("SUCCEEDING") | Some("FAILING") | Some("ABORTING") => {
            ExecutionPhase::Running
        }
        Some("SUCCEEDED") => ExecutionPhase::Succeeded,
        Some("FAILED") | Some("TIMED_OUT") => ExecutionPhase::Failed,
        Some("ABORTED") => ExecutionPhase::Aborted,
        Some(_) => ExecutionPhase::Unknown,
    }
}

impl From<ExecutionResponse> for ExecutionHandle {
    fn from(response: ExecutionResponse) -> Self {
        ExecutionHandle {
            execution_id: ExecutionId::new(response.id.name),
            phase: parse_phase(response.closure.phase.as_deref()),
        }
    }
}

fn launch_plan_id(id: &Identifier) -> String {
    format!(
        "{}:{}:{}:{}",
        id.project,
        id.domain,
        id.name,
        id.version.as_deref().unwrap_or_default()
    )
}

fn transport_error(e: reqwest::Error) -> WorkflowError {
    WorkflowError::Unavailable(e.to_string())
}

async fn rejected(response: reqwest::Response) -> WorkflowError {
    let status = response.status().as_u16();
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "failed to read error response".to_string());
    WorkflowError::Rejected { status, message }
}

impl FlyteAdminClient {
    /// Create a client for the given Flyte Admin endpoint.
    pub fn new(
        endpoint: impl Into<String>,
        project: impl Into<String>,
        domain: impl Into<String>,
    ) -> Result<Self, WorkflowError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| WorkflowError::Unavailable(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            project: project.into(),
            domain: domain.into(),
        })
    }

    fn launch_plan_url(&self, name: &str, version: &str) -> String {
        format!(
            "{}/api/v1/launch_plans/{}/{}/{}/{}",
            self.endpoint, self.project, self.domain, name, version
        )
    }

    fn execution_url(&self, execution_id: &ExecutionId) -> String {
        format!(
            "{}/api/v1/executions/{}/{}/{}",
            self.endpoint, self.project, self.domain, execution_id
        )
    }

    fn executions_url(&self) -> String {
        format!("{}/api/v1/executions/{}/{}", self.endpoint, self.project, self.domain)
    }

    fn create_body(&self, request: &StartRequest) -> Value {
        let tenant = &request.tenant;
        json!({
            "project": self.project,
            "domain": self.domain,
            "name": request.execution_id.as_str(),
            "spec": {
                "launch_plan": {
                    "resource_type": "LAUNCH_PLAN",
                    "project": self.project,
                    "domain": self.domain,
                    "name": request.workflow.name,
                    "version": request.workflow.version,
                },
                "metadata": { "mode": "MANUAL" },
                "labels": {
                    "values": {
                        "job_id": tenant.job_id.as_str(),
                        "organization_id": tenant.organization_id.as_str(),
                        "workspace_id": tenant.workspace_id.as_str(),
                        "session_id": tenant.session_id,
                    }
                },
            },
            "inputs": {
                "literals": {
                    "payload": { "scalar": { "generic": request.payload } },
                    "project_id": {
                        "scalar": { "primitive": {
                            "string_value": tenant.project_id.as_ref().map(|p| p.as_str()).unwrap_or_default()
                        } }
                    },
                }
            },
        })
    }

    fn name_filter(execution_ids: &[ExecutionId]) -> String {
        let names: Vec<&str> = execution_ids.iter().map(|id| id.as_str()).collect();
        format!("value_in(execution_name,{})", names.join(";"))
    }
}

#[async_trait]
impl WorkflowEngine for FlyteAdminClient {
    async fn fetch_workflow(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<WorkflowDef>, WorkflowError> {
        let response = self
            .client
            .get(self.launch_plan_url(name, version))
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let plan: LaunchPlanResponse = response
                    .json()
                    .await
                    .map_err(|e| WorkflowError::InvalidResponse(e.to_string()))?;
                Ok(Some(WorkflowDef {
                    name: name.to_string(),
                    version: version.to_string(),
                    launch_plan_id: launch_plan_id(&plan.id),
                }))
            }
            _ => Err(rejected(response).await),
        }
    }

    async fn fetch_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<ExecutionHandle>, WorkflowError> {
        let response = self
            .client
            .get(self.execution_url(execution_id))
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let execution: ExecutionResponse = response
                    .json()
                    .await
                    .map_err(|e| WorkflowError::InvalidResponse(e.to_string()))?;
                Ok(Some(execution.into()))
            }
            _ => Err(rejected(response).await),
        }
    }

    async fn start_execution(&self, request: StartRequest) -> Result<ExecutionHandle, WorkflowError> {
        let response = self
            .client
            .post(self.executions_url())
            .json(&self.create_body(&request))
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            // Already created by an earlier attempt with the same name.
            StatusCode::CONFLICT => Ok(ExecutionHandle {
                execution_id: request.execution_id,
                phase: ExecutionPhase::Queued,
            }),
            status if status.is_success() => {
                let created: CreateExecutionResponse = response
                    .json()
                    .await
                    .map_err(|e| WorkflowError::InvalidResponse(e.to_string()))?;
                Ok(ExecutionHandle {
                    execution_id: ExecutionId::new(created.id.name),
                    phase: ExecutionPhase::Queued,
                })
            }
            _ => Err(rejected(response).await),
        }
    }

    async fn list_executions(
        &self,
        execution_ids: &[ExecutionId],
    ) -> Result<Vec<ExecutionHandle>, WorkflowError> {
        if execution_ids.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .client
            .get(self.executions_url())
            .query(&[
                ("limit", execution_ids.len().to_string()),
                ("filters", Self::name_filter(execution_ids)),
            ])
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        let list: ExecutionListResponse = response
            .json()
            .await
            .map_err(|e| WorkflowError::InvalidResponse(e.to_string()))?;
        Ok(list.executions.into_iter().map(Into::into).collect())
    }
}
