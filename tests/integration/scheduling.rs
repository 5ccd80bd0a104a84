//! Execution driver integration tests.
//!
//! These tests drive jobs from admission through execution start, retry,
//! exhaustion and the revert lifecycle against the fake workflow engine.

use crate::common::{test_config, Harness};

use geti_jobs::core::job::FailureOrigin;
use geti_jobs::execution::execution_name;
use geti_jobs::storage::{ExecutionPatch, JobPatch};
use geti_jobs::testing::{fixture_job, FlakyJobStore};
use geti_jobs::workflow::ExecutionPhase;
use geti_jobs::{
    Completion, Event, ExecutionKind, InMemoryJobStore, JobId, JobState, JobStore, JobSubmitter,
    ScheduleOutcome,
};
use std::sync::Arc;

async fn submit_ready(h: &Harness<InMemoryJobStore>, id: &str, job_type: &str) {
    h.store
        .submit(fixture_job(id, job_type, id).with_state(JobState::ReadyForScheduling))
        .await
        .unwrap();
}

/// Test: a retried start finds the execution created by an earlier attempt.
#[tokio::test]
async fn test_start_reuses_existing_execution() {
    let h = Harness::in_memory().await;
    submit_ready(&h, "j1", "train").await;
    let name = execution_name(&JobId::new("j1"), ExecutionKind::Main);
    h.engine
        .insert_execution(name.clone(), ExecutionPhase::Running)
        .await;

    let outcome = h.driver.schedule_next().await.unwrap();

    assert_eq!(
        outcome,
        ScheduleOutcome::Scheduled {
            job_id: JobId::new("j1"),
            execution_id: name.clone(),
            reused: true,
        }
    );
    assert_eq!(h.engine.start_count().await, 0);
    assert_eq!(h.engine.execution_ids().await, vec![name]);
}

/// Test: starting twice for the same job creates exactly one execution.
#[tokio::test]
async fn test_repeated_start_creates_one_execution() {
    let h = Harness::in_memory().await;
    submit_ready(&h, "j1", "train").await;
    h.driver.schedule_next().await.unwrap();

    // Crash between start and record: the job is locked again without a handle.
    let patch = JobPatch::new()
        .with_state(JobState::Scheduling)
        .with_execution(ExecutionKind::Main, ExecutionPatch::default().clear_execution_id());
    assert!(h
        .store
        .update(&JobId::new("j1"), &patch, Some(JobState::Scheduled))
        .await
        .unwrap());
    let job = h.job("j1").await;

    let outcome = h.driver.drive(&job, ExecutionKind::Main).await.unwrap();

    assert!(matches!(outcome, ScheduleOutcome::Scheduled { reused: true, .. }));
    assert_eq!(h.engine.start_count().await, 1);
    assert_eq!(
        h.engine.execution_ids().await,
        vec![execution_name(&JobId::new("j1"), ExecutionKind::Main)]
    );
    assert_eq!(h.state_of("j1").await, JobState::Scheduled);
}

/// Test: a started job records its handle, launch plan and step template.
#[tokio::test]
async fn test_scheduled_job_records_execution() {
    let h = Harness::in_memory().await;
    submit_ready(&h, "j1", "train").await;

    h.driver.run_once(ExecutionKind::Main).await.unwrap();

    let job = h.job("j1").await;
    assert_eq!(job.state, JobState::Scheduled);
    assert_eq!(
        job.executions.main.execution_id,
        Some(execution_name(&job.id, ExecutionKind::Main))
    );
    assert_eq!(
        job.executions.main.flyte_launch_plan_id.as_deref(),
        Some("fake:train_workflow:v1")
    );
    let steps: Vec<&str> = job.step_details.iter().map(|s| s.step_name.as_str()).collect();
    assert_eq!(steps, vec!["Preparing dataset", "Training model"]);
    assert!(job.start_time.is_some());
}

/// Test: retry counter above the maximum fails the job without a start.
#[tokio::test]
async fn test_exhausted_retries_fail_job() {
    let h = Harness::in_memory().await;
    let mut job = fixture_job("j1", "train", "k1").with_state(JobState::ReadyForScheduling);
    job.executions.main.start_retry_counter = 6;
    h.store.submit(job).await.unwrap();

    let outcome = h.driver.schedule_next().await.unwrap();

    assert_eq!(
        outcome,
        ScheduleOutcome::Exhausted {
            job_id: JobId::new("j1"),
            state: JobState::Failed,
        }
    );
    assert_eq!(h.engine.start_count().await, 0);
    let job = h.job("j1").await;
    assert_eq!(job.state, JobState::Failed);
    let failure = job.failure.unwrap();
    assert_eq!(failure.origin, FailureOrigin::Platform);
    assert!(failure.message.contains("6 attempts"));
    assert!(h
        .events
        .events()
        .await
        .iter()
        .any(|e| matches!(e, Event::RetryExhausted { attempts: 6, .. })));
}

/// Test: exhausted retries of a cancelled job end in `Cancelled`.
#[tokio::test]
async fn test_exhausted_retries_of_cancelled_job() {
    let h = Harness::in_memory().await;
    let mut job = fixture_job("j1", "train", "k1").with_state(JobState::ReadyForScheduling);
    job.executions.main.start_retry_counter = 6;
    job.cancellation_info.is_cancelled = true;
    h.store.submit(job).await.unwrap();

    h.driver.schedule_next().await.unwrap();

    assert_eq!(h.state_of("j1").await, JobState::Cancelled);
}

/// Test: transient start failures are retried on later cycles.
#[tokio::test]
async fn test_transient_failures_are_retried() {
    let h = Harness::in_memory().await;
    submit_ready(&h, "j1", "train").await;
    h.engine.fail_starts(2).await;

    for attempt in 1..=2 {
        let outcomes = h.driver.run_once(ExecutionKind::Main).await.unwrap();
        assert_eq!(
            outcomes,
            vec![ScheduleOutcome::Retrying {
                job_id: JobId::new("j1"),
                attempts: attempt,
            }]
        );
        let job = h.job("j1").await;
        assert_eq!(job.state, JobState::ReadyForScheduling);
        assert_eq!(job.executions.main.start_retry_counter, attempt);
        assert!(job.executions.main.last_start_error.is_some());
    }

    h.driver.run_once(ExecutionKind::Main).await.unwrap();
    let job = h.job("j1").await;
    assert_eq!(job.state, JobState::Scheduled);
    assert!(job.executions.main.last_start_error.is_none());
    assert_eq!(h.engine.start_count().await, 3);
}

/// Test: an engine that stays down ends the job after the retry budget.
#[tokio::test]
async fn test_persistent_unavailability_exhausts_retries() {
    let mut config = test_config();
    config.max_start_retries = 2;
    let h = Harness::new(Arc::new(InMemoryJobStore::new()), config).await;
    submit_ready(&h, "j1", "train").await;
    h.engine.set_unavailable(true).await;

    let mut last = Vec::new();
    for _ in 0..4 {
        last = h.driver.run_once(ExecutionKind::Main).await.unwrap();
    }

    assert!(matches!(
        last.as_slice(),
        [ScheduleOutcome::Exhausted {
            state: JobState::Failed,
            ..
        }]
    ));
    let job = h.job("j1").await;
    assert_eq!(job.state, JobState::Failed);
    assert!(job.failure.unwrap().message.contains("fake engine is down"));

    // Nothing is left to schedule.
    assert!(h.driver.run_once(ExecutionKind::Main).await.unwrap().is_empty());
}

/// Test: a workflow missing from the engine is a retried failure.
#[tokio::test]
async fn test_missing_workflow_is_retried() {
    let h = Harness::in_memory().await;
    submit_ready(&h, "j1", "train").await;
    h.engine.hide_workflow("train_workflow").await;

    let outcome = h.driver.schedule_next().await.unwrap();

    assert!(matches!(outcome, ScheduleOutcome::Retrying { attempts: 1, .. }));
    assert_eq!(h.state_of("j1").await, JobState::ReadyForScheduling);
}

/// Test: a job type without a workflow mapping is left locked.
#[tokio::test]
async fn test_unmapped_job_type_stays_locked() {
    let h = Harness::in_memory().await;
    submit_ready(&h, "mystery", "unknown_type").await;
    submit_ready(&h, "j1", "train").await;

    let outcomes = h.driver.run_once(ExecutionKind::Main).await.unwrap();

    assert_eq!(h.state_of("mystery").await, JobState::Scheduling);
    assert_eq!(h.state_of("j1").await, JobState::Scheduled);
    assert_eq!(outcomes.len(), 1);
}

/// Test: a cancelled ready job is finished when it is locked.
#[tokio::test]
async fn test_cancelled_ready_job_finishes_on_lock() {
    let h = Harness::in_memory().await;
    let mut job = fixture_job("j1", "train", "k1").with_state(JobState::ReadyForScheduling);
    job.cancellation_info.is_cancelled = true;
    h.store.submit(job).await.unwrap();

    let outcome = h.driver.schedule_next().await.unwrap();

    assert_eq!(
        outcome,
        ScheduleOutcome::Cancelled {
            job_id: JobId::new("j1")
        }
    );
    assert_eq!(h.engine.start_count().await, 0);
}

/// Test: a failed job runs its compensating workflow and ends failed.
#[tokio::test]
async fn test_failed_job_is_reverted() {
    let h = Harness::in_memory().await;
    h.store.submit(fixture_job("j1", "train", "k1")).await.unwrap();

    h.admission.run_once().await.unwrap();
    h.driver.run_once(ExecutionKind::Main).await.unwrap();
    let main_id = h.job("j1").await.executions.main.execution_id.unwrap();
    let state = h
        .ingestor
        .report_completion(
            &main_id,
            Completion::Failure {
                message: "out of memory".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(state, JobState::ReadyForRevert);

    let outcomes = h.driver.run_once(ExecutionKind::Revert).await.unwrap();
    assert!(matches!(outcomes.as_slice(), [ScheduleOutcome::Scheduled { reused: false, .. }]));
    let job = h.job("j1").await;
    assert_eq!(job.state, JobState::RevertScheduled);
    let revert_id = job.executions.revert.execution_id.unwrap();
    assert!(revert_id.as_str().starts_with('r'));

    let state = h
        .ingestor
        .report_progress(&revert_id, Vec::new())
        .await
        .unwrap();
    assert_eq!(state, JobState::Reverting);
    let state = h
        .ingestor
        .report_completion(&revert_id, Completion::Success)
        .await
        .unwrap();
    assert_eq!(state, JobState::Failed);
    assert!(h
        .job("j1")
        .await
        .failure
        .unwrap()
        .message
        .contains("out of memory"));
}

/// Test: every observed state change is an edge of the lifecycle graph.
#[tokio::test]
async fn test_observed_transitions_are_legal() {
    let h = Harness::in_memory().await;
    for i in 0..3 {
        let id = format!("j{}", i);
        h.store.submit(fixture_job(&id, "train", &id)).await.unwrap();
    }
    h.engine.fail_starts(1).await;

    h.admission.run_once().await.unwrap();
    for _ in 0..3 {
        h.driver.run_once(ExecutionKind::Main).await.unwrap();
    }
    let ids: Vec<_> = (0..3).map(|i| format!("j{}", i)).collect();
    let first = h.job(&ids[0]).await.executions.main.execution_id.unwrap();
    let second = h.job(&ids[1]).await.executions.main.execution_id.unwrap();
    h.ingestor.report_progress(&first, Vec::new()).await.unwrap();
    h.ingestor
        .report_completion(&first, Completion::Success)
        .await
        .unwrap();
    h.ingestor.cancel(&JobId::new(&ids[1]), None).await.unwrap();
    h.ingestor
        .report_completion(&second, Completion::Success)
        .await
        .unwrap();
    h.driver.run_once(ExecutionKind::Revert).await.unwrap();

    let changes = h.events.state_changes().await;
    assert!(!changes.is_empty());
    for (from, to) in changes {
        assert!(from.can_transition_to(to), "illegal transition {} -> {}", from, to);
    }
    assert_eq!(h.state_of(&ids[0]).await, JobState::Done);
    assert_eq!(h.state_of(&ids[1]).await, JobState::RevertScheduled);
}

/// Test: a store failure while recording the started execution returns the lock.
#[tokio::test]
async fn test_failed_record_releases_lock() {
    let h = Harness::new(Arc::new(FlakyJobStore::new()), test_config()).await;
    h.store
        .submit(fixture_job("j1", "train", "k1").with_state(JobState::ReadyForScheduling))
        .await
        .unwrap();
    h.store.fail_next_write(JobState::Scheduled).await;

    let outcomes = h.driver.run_once(ExecutionKind::Main).await.unwrap();

    assert_eq!(
        outcomes,
        vec![ScheduleOutcome::Retrying {
            job_id: JobId::new("j1"),
            attempts: 1,
        }]
    );
    let job = h.job("j1").await;
    assert_eq!(job.state, JobState::ReadyForScheduling);
    assert!(job.executions.main.last_start_error.is_some());

    h.driver.run_once(ExecutionKind::Main).await.unwrap();

    let job = h.job("j1").await;
    assert_eq!(job.state, JobState::Scheduled);
    assert_eq!(
        job.executions.main.execution_id,
        Some(execution_name(&JobId::new("j1"), ExecutionKind::Main))
    );
    assert_eq!(h.engine.start_count().await, 1);
}

/// Test: a lock that could not be returned is released by recovery.
#[tokio::test]
async fn test_unreleased_lock_is_recovered() {
    let mut config = test_config();
    config.lock_timeout = 0;
    let h = Harness::new(Arc::new(FlakyJobStore::new()), config).await;
    h.store
        .submit(fixture_job("j1", "train", "k1").with_state(JobState::ReadyForScheduling))
        .await
        .unwrap();
    h.store.fail_next_write(JobState::Scheduled).await;
    h.store.fail_next_write(JobState::ReadyForScheduling).await;

    assert!(h.driver.run_once(ExecutionKind::Main).await.is_err());
    assert_eq!(h.state_of("j1").await, JobState::Scheduling);

    let report = h.recovery.run_once().await.unwrap();

    assert_eq!(report.released, vec![JobId::new("j1")]);
    assert_eq!(h.state_of("j1").await, JobState::ReadyForScheduling);

    let outcomes = h.driver.run_once(ExecutionKind::Main).await.unwrap();
    assert!(matches!(
        outcomes.as_slice(),
        [ScheduleOutcome::Scheduled { reused: true, .. }]
    ));
    assert_eq!(h.state_of("j1").await, JobState::Scheduled);
    assert_eq!(h.engine.start_count().await, 1);
}
