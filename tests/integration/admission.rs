//! Admission integration tests.
//!
//! These tests run the admission engine against the in-memory store for
//! every policy kind and check what gets promoted.

use crate::common::{test_config, Harness};

use chrono::{Duration as ChronoDuration, Utc};
use geti_jobs::config::{JobTypeConfig, PolicyValue};
use geti_jobs::policy::{AdmissionEngine, Policy, PolicyResolver, StaticCapacity};
use geti_jobs::testing::fixture_job;
use geti_jobs::{
    Completion, ExecutionKind, InMemoryJobStore, Job, JobId, JobState, JobSubmitter,
    ScheduleOutcome, Tenant,
};
use std::sync::Arc;

/// A submitted job created `age` seconds ago.
fn job(id: &str, job_type: &str, key: &str, priority: i32, age: i64) -> Job {
    fixture_job(id, job_type, key)
        .with_priority(priority)
        .with_creation_time(Utc::now() - ChronoDuration::seconds(age))
}

async fn submit_all(h: &Harness<InMemoryJobStore>, jobs: Vec<Job>) {
    for job in jobs {
        h.store.submit(job).await.unwrap();
    }
}

async fn scheduled_order(h: &Harness<InMemoryJobStore>) -> Vec<JobId> {
    let mut order = Vec::new();
    loop {
        match h.driver.schedule_next().await.unwrap() {
            ScheduleOutcome::Scheduled { job_id, .. } => order.push(job_id),
            ScheduleOutcome::Idle => break,
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
    order
}

/// Test: limit 10 with two running jobs admits all three submitted jobs,
/// which are then scheduled by priority and creation time.
#[tokio::test]
async fn test_max_running_admits_all_below_limit() {
    let h = Harness::in_memory().await;
    submit_all(
        &h,
        vec![
            job("running-1", "train", "r1", 0, 100).with_state(JobState::Running),
            job("running-2", "train", "r2", 0, 90).with_state(JobState::Running),
            job("a", "train", "ka", 5, 30),
            job("b", "train", "kb", 3, 20),
            job("c", "train", "kc", 5, 10),
        ],
    )
    .await;

    let report = h.admission.run_once().await.unwrap();

    assert_eq!(report.promoted.len(), 3);
    for id in ["a", "b", "c"] {
        assert_eq!(h.state_of(id).await, JobState::ReadyForScheduling);
    }
    assert_eq!(
        scheduled_order(&h).await,
        vec![JobId::new("a"), JobId::new("c"), JobId::new("b")]
    );
}

/// Test: remaining capacity is filled by priority, then creation time.
#[tokio::test]
async fn test_max_running_caps_at_remaining_capacity() {
    let config = test_config().with_job_type(
        JobTypeConfig::new("optimize", "optimize_workflow", "v1").with_policy(PolicyValue::Limit(3)),
    );
    let h = Harness::new(Arc::new(InMemoryJobStore::new()), config).await;
    submit_all(
        &h,
        vec![
            job("running-1", "optimize", "r1", 0, 100).with_state(JobState::Scheduled),
            job("running-2", "optimize", "r2", 0, 90).with_state(JobState::Running),
            job("low", "optimize", "k1", 1, 50),
            job("late-high", "optimize", "k2", 5, 10),
            job("early-high", "optimize", "k3", 5, 40),
        ],
    )
    .await;

    let report = h.admission.run_once().await.unwrap();

    assert_eq!(report.promoted, vec![JobId::new("early-high")]);
    assert_eq!(h.state_of("late-high").await, JobState::Submitted);
    assert_eq!(h.state_of("low").await, JobState::Submitted);

    // A full group stays full.
    let again = h.admission.run_once().await.unwrap();
    assert!(again.promoted.is_empty());
}

/// Test: unknown GPU capacity admits nothing.
#[tokio::test]
async fn test_gpu_policy_unknown_capacity() {
    let h = Harness::in_memory().await;
    submit_all(
        &h,
        (0..4)
            .map(|i| job(&format!("inf-{}", i), "inference", &format!("k{}", i), 0, 10 - i))
            .collect(),
    )
    .await;

    let report = h.admission.run_once().await.unwrap();

    assert!(report.promoted.is_empty());
    assert_eq!(report.skipped, 1);
    for i in 0..4 {
        assert_eq!(h.state_of(&format!("inf-{}", i)).await, JobState::Submitted);
    }
}

/// Test: GPU reservations bound admission and are returned by terminal transitions.
#[tokio::test]
async fn test_gpu_reservation_released_on_completion() {
    let h = Harness::in_memory().await;
    h.capacity.set_gpu_capacity(Some(1));
    submit_all(
        &h,
        vec![
            job("first", "inference", "k1", 0, 20),
            job("second", "inference", "k2", 0, 10),
        ],
    )
    .await;

    let report = h.admission.run_once().await.unwrap();
    assert_eq!(report.promoted, vec![JobId::new("first")]);
    assert!(h.job("first").await.gpu_reserved);

    assert!(h.admission.run_once().await.unwrap().promoted.is_empty());

    h.driver.run_once(ExecutionKind::Main).await.unwrap();
    let execution_id = h.job("first").await.executions.main.execution_id.unwrap();
    let state = h
        .ingestor
        .report_completion(&execution_id, Completion::Success)
        .await
        .unwrap();
    assert_eq!(state, JobState::Done);
    assert!(!h.job("first").await.gpu_reserved);

    let report = h.admission.run_once().await.unwrap();
    assert_eq!(report.promoted, vec![JobId::new("second")]);
}

/// Test: quota is applied per organization.
#[tokio::test]
async fn test_quota_policy_per_organization() {
    let h = Harness::in_memory().await;
    let capacity = Arc::new(StaticCapacity::new(None, 1).with_quota("org-big", 3));
    let resolver = PolicyResolver::from_config(&h.config).with_env_lookup(|_| None);
    let admission = AdmissionEngine::new(h.state_machine.clone(), resolver, capacity);

    for i in 0..3 {
        for org in ["org-big", "org-small"] {
            let id = format!("{}-{}", org, i);
            let job = Job::new("export", id.as_str(), Tenant::new(org, "ws"))
                .with_id(id.as_str())
                .with_creation_time(Utc::now() - ChronoDuration::seconds(10 - i));
            h.store.submit(job).await.unwrap();
        }
    }

    let report = admission.run_once().await.unwrap();

    assert_eq!(report.groups, 2);
    assert_eq!(report.promoted.len(), 4);
    assert_eq!(h.state_of("org-small-0").await, JobState::ReadyForScheduling);
    assert_eq!(h.state_of("org-small-1").await, JobState::Submitted);
    for i in 0..3 {
        assert_eq!(
            h.state_of(&format!("org-big-{}", i)).await,
            JobState::ReadyForScheduling
        );
    }
}

/// Test: two submitted jobs sharing a key are never admitted together.
#[tokio::test]
async fn test_duplicate_key_is_admitted_once_at_a_time() {
    let h = Harness::in_memory().await;
    submit_all(
        &h,
        vec![
            job("older", "train", "project-1", 0, 20),
            job("newer", "train", "project-1", 9, 10),
        ],
    )
    .await;

    let first = h.admission.run_once().await.unwrap();
    assert_eq!(first.promoted, vec![JobId::new("newer")]);
    assert!(h.admission.run_once().await.unwrap().promoted.is_empty());
    assert_eq!(h.state_of("older").await, JobState::Submitted);

    // The key is freed once the first job finishes.
    h.driver.run_once(ExecutionKind::Main).await.unwrap();
    let execution_id = h.job("newer").await.executions.main.execution_id.unwrap();
    h.ingestor
        .report_completion(&execution_id, Completion::Success)
        .await
        .unwrap();

    let next = h.admission.run_once().await.unwrap();
    assert_eq!(next.promoted, vec![JobId::new("older")]);
}

/// Test: cancelled submitted jobs are never admitted.
#[tokio::test]
async fn test_cancelled_jobs_are_not_admitted() {
    let h = Harness::in_memory().await;
    submit_all(&h, vec![job("keep", "train", "k1", 0, 20), job("drop", "train", "k2", 0, 10)]).await;
    h.ingestor.cancel(&JobId::new("drop"), None).await.unwrap();

    let report = h.admission.run_once().await.unwrap();

    assert_eq!(report.promoted, vec![JobId::new("keep")]);
    assert_eq!(h.state_of("drop").await, JobState::Cancelled);
}

/// Test: an environment override replaces the configured policy.
#[tokio::test]
async fn test_environment_override() {
    let h = Harness::in_memory().await;
    let resolver = PolicyResolver::from_config(&h.config).with_env_lookup(|name| {
        (name == PolicyResolver::env_var_name("train")).then(|| "1".to_string())
    });
    let admission = AdmissionEngine::new(
        h.state_machine.clone(),
        resolver,
        Arc::new(StaticCapacity::new(None, 0)),
    );
    submit_all(
        &h,
        vec![
            job("a", "train", "ka", 0, 30),
            job("b", "train", "kb", 0, 20),
            job("c", "inference", "kc", 0, 10),
        ],
    )
    .await;

    let policies = admission.current_policies().await.unwrap();
    assert_eq!(policies.get("train"), Some(&Policy::MaxRunning(1)));
    assert_eq!(policies.get("inference"), Some(&Policy::Gpu));

    let report = admission.run_once().await.unwrap();
    assert_eq!(report.promoted, vec![JobId::new("a")]);
}
