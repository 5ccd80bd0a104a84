//! HTTP API module for the job scheduler.
//!
//! Provides the endpoints running workloads report through, minimal job
//! inspection and cancellation, and scheduler control.

mod errors;
mod handlers;
mod responses;

pub use errors::{ApiError, ErrorResponse};
pub use handlers::ApiState;
pub use responses::*;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::{ApiConfig, SchedulerConfig};
use crate::ingest::UpdateIngestor;
use crate::lifecycle::StateMachine;
use crate::scheduler::SchedulerHandle;
use crate::storage::JobStore;

/// Build the API router with all endpoints.
pub fn build_router<S: JobStore + 'static>(state: ApiState<S>) -> Router {
    Router::new()
        // Health check
        .route("/api/health", get(handlers::health))
        // Jobs
        .route("/api/jobs", get(handlers::list_jobs::<S>))
        .route("/api/jobs/{job_id}", get(handlers::get_job::<S>))
        .route("/api/jobs/{job_id}/cancel", post(handlers::cancel_job::<S>))
        // Workload reports
        .route(
            "/api/executions/{execution_id}/update",
            post(handlers::update_execution::<S>),
        )
        .route(
            "/api/executions/{execution_id}/progress",
            post(handlers::report_progress::<S>),
        )
        .route(
            "/api/executions/{execution_id}/completion",
            post(handlers::report_completion::<S>),
        )
        // Scheduler control
        .route(
            "/api/scheduler/state",
            get(handlers::get_scheduler_state::<S>),
        )
        .route("/api/scheduler/pause", post(handlers::pause_scheduler::<S>))
        .route(
            "/api/scheduler/resume",
            post(handlers::resume_scheduler::<S>),
        )
        .route("/api/scheduler/run", post(handlers::run_cycle::<S>))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Create the API state from scheduler components.
pub fn create_api_state<S: JobStore>(
    state_machine: Arc<StateMachine<S>>,
    config: &SchedulerConfig,
    handle: Option<SchedulerHandle>,
) -> ApiState<S> {
    ApiState {
        store: state_machine.store().clone(),
        ingestor: Arc::new(UpdateIngestor::new(state_machine, config)),
        handle,
    }
}

/// Start the API server.
///
/// This function spawns the server and returns a handle to the task.
/// The server runs until the task is aborted or the process exits.
pub async fn start_server<S: JobStore + 'static>(
    config: &ApiConfig,
    state: ApiState<S>,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    let router = build_router(state);
    let addr = config.bind_address();

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("API server listening on http://{}", listener.local_addr()?);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!("API server error: {}", e);
        }
    });

    Ok(handle)
}
