//! API request handlers.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::core::state::JobState;
use crate::core::types::{ExecutionId, JobId, UserId};
use crate::ingest::{JobUpdate, UpdateIngestor};
use crate::scheduler::{Cycle, SchedulerHandle};
use crate::storage::{FindOrder, JobFilter, JobStore};

use super::errors::ApiError;
use super::responses::{
    CancelResponse, CompletionRequest, HealthResponse, JobListResponse, JobResponse,
    MessageResponse, ProgressRequest, ReportResponse, RunCycleResponse, SchedulerStateResponse,
    UpdateResponse,
};

/// Upper bound of the `limit` query parameter.
const MAX_LIST_LIMIT: usize = 500;

/// Shared application state for API handlers.
pub struct ApiState<S: JobStore> {
    pub store: Arc<S>,
    pub ingestor: Arc<UpdateIngestor<S>>,
    /// Absent when the service runs without the built-in scheduler.
    pub handle: Option<SchedulerHandle>,
}

impl<S: JobStore> Clone for ApiState<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            ingestor: Arc::clone(&self.ingestor),
            handle: self.handle.clone(),
        }
    }
}

impl<S: JobStore> ApiState<S> {
    fn scheduler(&self) -> Result<&SchedulerHandle, ApiError> {
        self.handle
            .as_ref()
            .ok_or_else(|| ApiError::ServiceUnavailable("scheduler is not running".to_string()))
    }
}

/// Query parameters for the list_jobs endpoint.
#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub state: Option<String>,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
pub struct CancelQuery {
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RunQuery {
    pub cycle: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::default())
}

/// Get a specific job.
pub async fn get_job<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = state.store.get(&JobId::new(job_id)).await?;
    Ok(Json(JobResponse::from(&job)))
}

/// List jobs, most recent first.
pub async fn list_jobs<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<JobListResponse>, ApiError> {
    let mut filter = JobFilter::new();
    if let Some(raw) = query.state.as_deref() {
        let job_state: JobState = raw.parse().map_err(ApiError::InvalidRequest)?;
        filter = filter.with_state(job_state);
    }
    if let Some(job_type) = query.job_type {
        filter = filter.with_job_types([job_type]);
    }
    let limit = query.limit.clamp(1, MAX_LIST_LIMIT);

    let jobs = state
        .store
        .find(&filter, FindOrder::Latest, Some(limit))
        .await?;
    let jobs: Vec<JobResponse> = jobs.iter().map(JobResponse::from).collect();
    let count = jobs.len();
    Ok(Json(JobListResponse { jobs, count }))
}

/// Request cancellation of a job.
pub async fn cancel_job<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
    Query(query): Query<CancelQuery>,
) -> Result<Json<CancelResponse>, ApiError> {
    let outcome = state
        .ingestor
        .cancel(&JobId::new(&job_id), query.user_id.map(UserId::new))
        .await?;
    Ok(Json(CancelResponse::new(job_id, outcome)))
}

/// Apply an update sent by a running workload.
pub async fn update_execution<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
    Path(execution_id): Path<String>,
    Json(update): Json<JobUpdate>,
) -> Result<Json<UpdateResponse>, ApiError> {
    let job_id = state
        .ingestor
        .apply_update(&ExecutionId::new(&execution_id), &update)
        .await?;
    Ok(Json(UpdateResponse {
        job_id: job_id.to_string(),
        execution_id,
    }))
}

/// Merge step progress of an execution.
pub async fn report_progress<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
    Path(execution_id): Path<String>,
    Json(request): Json<ProgressRequest>,
) -> Result<Json<ReportResponse>, ApiError> {
    let job_state = state
        .ingestor
        .report_progress(&ExecutionId::new(&execution_id), request.steps)
        .await?;
    Ok(Json(ReportResponse {
        execution_id,
        state: job_state,
    }))
}

/// Record the end of an execution.
pub async fn report_completion<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
    Path(execution_id): Path<String>,
    Json(request): Json<CompletionRequest>,
) -> Result<Json<ReportResponse>, ApiError> {
    let job_state = state
        .ingestor
        .report_completion(&ExecutionId::new(&execution_id), request.into())
        .await?;
    Ok(Json(ReportResponse {
        execution_id,
        state: job_state,
    }))
}

/// Get scheduler state.
pub async fn get_scheduler_state<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<SchedulerStateResponse>, ApiError> {
    let scheduler_state = state.scheduler()?.state().await;
    Ok(Json(SchedulerStateResponse::from(scheduler_state)))
}

/// Pause the scheduler.
pub async fn pause_scheduler<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.scheduler()?.pause().await?;
    Ok(Json(MessageResponse {
        message: "scheduler paused".to_string(),
    }))
}

/// Resume the scheduler.
pub async fn resume_scheduler<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.scheduler()?.resume().await?;
    Ok(Json(MessageResponse {
        message: "scheduler resumed".to_string(),
    }))
}

/// Run one cycle immediately.
pub async fn run_cycle<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
    Query(query): Query<RunQuery>,
) -> Result<Json<RunCycleResponse>, ApiError> {
    let cycle: Cycle = query.cycle.parse()?;
    let report = state.scheduler()?.run_now(cycle).await?;
    Ok(Json(RunCycleResponse::from((cycle, &report))))
}
