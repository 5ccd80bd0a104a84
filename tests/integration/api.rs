//! API integration tests.
//!
//! These tests drive the router in-process and check status codes, error
//! codes and response bodies.

use crate::common::{test_config, Harness};

use geti_jobs::api::{build_router, create_api_state, ApiState};
use geti_jobs::scheduler::Cycle;
use geti_jobs::testing::{fixture_job, UnavailableJobStore};
use geti_jobs::{
    ExecutionKind, InMemoryJobStore, JobState, JobSubmitter, Scheduler, StaticCapacity,
};

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

/// API state without a running scheduler.
fn api_state(h: &Harness<InMemoryJobStore>) -> ApiState<InMemoryJobStore> {
    create_api_state(h.state_machine.clone(), &h.config, None)
}

async fn send(router: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };

    let response = router.oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

/// Admit and start a `train` job, returning its main execution id.
async fn started(h: &Harness<InMemoryJobStore>, id: &str) -> String {
    h.store.submit(fixture_job(id, "train", id)).await.unwrap();
    h.admission.run_once().await.unwrap();
    h.driver.run_once(ExecutionKind::Main).await.unwrap();
    h.job(id).await.executions.main.execution_id.unwrap().to_string()
}

/// Test: health endpoint responds with status ok.
#[tokio::test]
async fn test_health_endpoint() {
    let h = Harness::in_memory().await;

    let (status, json) = send(build_router(api_state(&h)), Method::GET, "/api/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

/// Test: a job is returned with its lifecycle fields.
#[tokio::test]
async fn test_get_job() {
    let h = Harness::in_memory().await;
    let execution_id = started(&h, "j1").await;

    let (status, json) = send(build_router(api_state(&h)), Method::GET, "/api/jobs/j1", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["id"], "j1");
    assert_eq!(json["type"], "train");
    assert_eq!(json["state"], "scheduled");
    assert_eq!(json["organization_id"], "org-test");
    assert_eq!(json["main_execution_id"], execution_id.as_str());
    assert_eq!(json["step_details"].as_array().unwrap().len(), 2);
}

/// Test: an unknown job is a 404.
#[tokio::test]
async fn test_get_unknown_job() {
    let h = Harness::in_memory().await;

    let (status, json) = send(build_router(api_state(&h)), Method::GET, "/api/jobs/nope", None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "NOT_FOUND");
}

/// Test: jobs can be listed by state and type.
#[tokio::test]
async fn test_list_jobs_with_filters() {
    let h = Harness::in_memory().await;
    h.store.submit(fixture_job("a", "train", "ka")).await.unwrap();
    h.store.submit(fixture_job("b", "export", "kb")).await.unwrap();
    h.store
        .submit(fixture_job("c", "train", "kc").with_state(JobState::Done))
        .await
        .unwrap();
    let router = build_router(api_state(&h));

    let (status, json) = send(router.clone(), Method::GET, "/api/jobs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 3);

    let (_, json) = send(
        router.clone(),
        Method::GET,
        "/api/jobs?state=submitted&type=train",
        None,
    )
    .await;
    assert_eq!(json["count"], 1);
    assert_eq!(json["jobs"][0]["id"], "a");

    let (_, json) = send(router, Method::GET, "/api/jobs?limit=1", None).await;
    assert_eq!(json["jobs"].as_array().unwrap().len(), 1);
}

/// Test: an unknown state filter is rejected.
#[tokio::test]
async fn test_list_jobs_bad_state() {
    let h = Harness::in_memory().await;

    let (status, json) = send(
        build_router(api_state(&h)),
        Method::GET,
        "/api/jobs?state=sleeping",
        None,
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "INVALID_REQUEST");
}

/// Test: cancel reports what happened to the job.
#[tokio::test]
async fn test_cancel_job() {
    let h = Harness::in_memory().await;
    h.store.submit(fixture_job("waiting", "train", "k1")).await.unwrap();
    started(&h, "busy").await;
    let router = build_router(api_state(&h));

    let (status, json) = send(
        router.clone(),
        Method::POST,
        "/api/jobs/waiting/cancel?user_id=user-1",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "cancelled");
    assert_eq!(json["state"], "cancelled");
    let job = h.job("waiting").await;
    assert_eq!(job.cancellation_info.user_id.unwrap().as_str(), "user-1");

    let (_, json) = send(router.clone(), Method::POST, "/api/jobs/busy/cancel", None).await;
    assert_eq!(json["outcome"], "flagged");
    assert_eq!(json["state"], "scheduled");

    let (status, _) = send(router, Method::POST, "/api/jobs/nope/cancel", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

/// Test: a workload update is applied to the owning job.
#[tokio::test]
async fn test_update_execution() {
    let h = Harness::in_memory().await;
    let execution_id = started(&h, "j1").await;

    let (status, json) = send(
        build_router(api_state(&h)),
        Method::POST,
        &format!("/api/executions/{}/update", execution_id),
        Some(json!({"metadata": {"foo": "bar"}})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["job_id"], "j1");
    assert_eq!(h.job("j1").await.metadata["foo"], "bar");
}

/// Test: an update for an unknown execution is a distinguishable 404.
#[tokio::test]
async fn test_update_unknown_execution() {
    let h = Harness::in_memory().await;

    let (status, json) = send(
        build_router(api_state(&h)),
        Method::POST,
        "/api/executions/m-unknown/update",
        Some(json!({"gpu": {"action": "RELEASE"}})),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "EXECUTION_NOT_FOUND");
}

/// Test: an empty update is a bad request.
#[tokio::test]
async fn test_empty_update_is_rejected() {
    let h = Harness::in_memory().await;
    let execution_id = started(&h, "j1").await;

    let (status, json) = send(
        build_router(api_state(&h)),
        Method::POST,
        &format!("/api/executions/{}/update", execution_id),
        Some(json!({})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "INVALID_REQUEST");
}

/// Test: an unreachable database is reported as 503.
#[tokio::test]
async fn test_database_unavailable() {
    let h = Harness::new(Arc::new(UnavailableJobStore), test_config()).await;
    let router = build_router(create_api_state(h.state_machine.clone(), &h.config, None));

    let (status, json) = send(
        router.clone(),
        Method::POST,
        "/api/executions/m-1/update",
        Some(json!({"metadata": {"a": 1}})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["code"], "DATABASE_UNAVAILABLE");

    let (status, json) = send(router, Method::GET, "/api/jobs/j1", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["code"], "DATABASE_UNAVAILABLE");
}

/// Test: progress and completion reports move the job to its final state.
#[tokio::test]
async fn test_progress_and_completion() {
    let h = Harness::in_memory().await;
    let execution_id = started(&h, "j1").await;
    let router = build_router(api_state(&h));

    let (status, json) = send(
        router.clone(),
        Method::POST,
        &format!("/api/executions/{}/progress", execution_id),
        Some(json!({"steps": [{"index": 0, "state": "finished", "progress": 100.0}]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "running");

    let (status, json) = send(
        router.clone(),
        Method::POST,
        &format!("/api/executions/{}/completion", execution_id),
        Some(json!({"status": "failure", "message": "disk full"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "ready_for_revert");

    let (status, json) = send(
        router,
        Method::POST,
        &format!("/api/executions/{}/completion", execution_id),
        Some(json!({"status": "success"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["code"], "CONFLICT");
}

/// Test: scheduler endpoints report unavailable without a scheduler.
#[tokio::test]
async fn test_scheduler_endpoints_without_scheduler() {
    let h = Harness::in_memory().await;
    let router = build_router(api_state(&h));

    for (method, uri) in [
        (Method::GET, "/api/scheduler/state"),
        (Method::POST, "/api/scheduler/pause"),
        (Method::POST, "/api/scheduler/resume"),
        (Method::POST, "/api/scheduler/run?cycle=admission"),
    ] {
        let (status, json) = send(router.clone(), method, uri, None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{}", uri);
        assert_eq!(json["code"], "SERVICE_UNAVAILABLE");
    }
}

/// Test: scheduler control through the API.
#[tokio::test]
async fn test_scheduler_control() {
    let h = Harness::in_memory().await;
    let scheduler = Scheduler::from_config(
        h.state_machine.clone(),
        h.engine.clone(),
        Arc::new(StaticCapacity::new(None, 2)),
        &h.config,
    );
    let scheduler = Cycle::ALL
        .iter()
        .fold(scheduler, |s, cycle| s.with_interval(*cycle, Duration::from_secs(3600)));
    let (handle, _task) = scheduler.start();
    let router = build_router(create_api_state(
        h.state_machine.clone(),
        &h.config,
        Some(handle.clone()),
    ));

    let (status, json) = send(router.clone(), Method::GET, "/api/scheduler/state", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "running");
    assert_eq!(json["is_running"], true);

    let (status, _) = send(router.clone(), Method::POST, "/api/scheduler/pause", None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, json) = send(router.clone(), Method::GET, "/api/scheduler/state", None).await;
    assert_eq!(json["state"], "paused");
    assert_eq!(json["is_paused"], true);

    h.store.submit(fixture_job("j1", "train", "k1")).await.unwrap();
    let (status, json) = send(
        router.clone(),
        Method::POST,
        "/api/scheduler/run?cycle=admission",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["cycle"], "admission");
    assert_eq!(json["affected"], 1);
    assert_eq!(h.state_of("j1").await, JobState::ReadyForScheduling);

    let (status, json) = send(router.clone(), Method::POST, "/api/scheduler/run?cycle=bogus", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "INVALID_REQUEST");

    let (status, _) = send(router.clone(), Method::POST, "/api/scheduler/resume", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(handle.is_running().await);

    handle.shutdown().await.unwrap();
}
