//! Update ingestion integration tests.

use crate::common::{test_config, Harness};

use chrono::Utc;
use geti_jobs::core::job::{ConsumedCost, StepState};
use geti_jobs::ingest::{CostUpdate, GpuAction, GpuUpdate};
use geti_jobs::storage::JobFilter;
use geti_jobs::testing::{fixture_job, UnavailableJobStore};
use geti_jobs::{
    CancelOutcome, Completion, ExecutionId, ExecutionKind, IngestError, InMemoryJobStore, JobId,
    JobState, JobStore, JobSubmitter, JobUpdate, StepProgress, StorageError,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Admit and start a `train` job, returning its main execution id.
async fn started(h: &Harness<InMemoryJobStore>, id: &str) -> ExecutionId {
    h.store.submit(fixture_job(id, "train", id)).await.unwrap();
    h.admission.run_once().await.unwrap();
    h.driver.run_once(ExecutionKind::Main).await.unwrap();
    h.job(id).await.executions.main.execution_id.unwrap()
}

fn metadata(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("metadata must be an object"),
    }
}

/// Test: GPU release and metadata merges are applied in order.
#[tokio::test]
async fn test_gpu_release_and_metadata_merge() {
    let h = Harness::in_memory().await;
    h.capacity.set_gpu_capacity(Some(1));
    h.store.submit(fixture_job("j1", "inference", "k1")).await.unwrap();
    h.admission.run_once().await.unwrap();
    h.driver.run_once(ExecutionKind::Main).await.unwrap();
    let execution_id = h.job("j1").await.executions.main.execution_id.unwrap();
    assert!(h.job("j1").await.gpu_reserved);

    let release = JobUpdate {
        gpu: Some(GpuUpdate {
            action: GpuAction::Release,
        }),
        ..Default::default()
    };
    let job_id = h.ingestor.apply_update(&execution_id, &release).await.unwrap();
    assert_eq!(job_id, JobId::new("j1"));
    assert!(!h.job("j1").await.gpu_reserved);

    for value in [json!({"foo": "bar"}), json!({"foo": "baz", "qux": 1})] {
        let update = JobUpdate {
            metadata: Some(metadata(value)),
            ..Default::default()
        };
        h.ingestor.apply_update(&execution_id, &update).await.unwrap();
    }

    let job = h.job("j1").await;
    assert_eq!(Value::Object(job.metadata), json!({"foo": "baz", "qux": 1}));
    assert_eq!(job.state, JobState::Scheduled);
}

/// Test: consumed cost entries are appended, never replaced.
#[tokio::test]
async fn test_consumed_cost_is_appended() {
    let h = Harness::in_memory().await;
    let execution_id = started(&h, "j1").await;
    let entry = |amount| ConsumedCost {
        amount,
        unit: "images".to_string(),
        consumed_at: Utc::now(),
        service: "training".to_string(),
    };

    for amount in [10, 25] {
        let update = JobUpdate {
            cost: Some(CostUpdate {
                consumed: vec![entry(amount)],
            }),
            ..Default::default()
        };
        h.ingestor.apply_update(&execution_id, &update).await.unwrap();
    }

    let amounts: Vec<i64> = h.job("j1").await.cost.consumed.iter().map(|c| c.amount).collect();
    assert_eq!(amounts, vec![10, 25]);
}

/// Test: an update for an unknown execution is reported as such.
#[tokio::test]
async fn test_unknown_execution() {
    let h = Harness::in_memory().await;
    started(&h, "j1").await;
    let update = JobUpdate {
        metadata: Some(metadata(json!({"a": 1}))),
        ..Default::default()
    };

    let result = h
        .ingestor
        .apply_update(&ExecutionId::new("m-does-not-exist"), &update)
        .await;

    assert!(matches!(result, Err(IngestError::ExecutionNotFound(_))));
}

/// Test: an update without any change is rejected before any lookup.
#[tokio::test]
async fn test_empty_update_is_invalid() {
    let h = Harness::in_memory().await;

    let result = h
        .ingestor
        .apply_update(&ExecutionId::new("m-1"), &JobUpdate::default())
        .await;

    assert!(matches!(result, Err(IngestError::Invalid(_))));
}

/// Test: an unreachable database is distinguishable from a missing execution.
#[tokio::test]
async fn test_unreachable_database() {
    let h = Harness::new(Arc::new(UnavailableJobStore), test_config()).await;
    let update = JobUpdate {
        metadata: Some(metadata(json!({"a": 1}))),
        ..Default::default()
    };

    let result = h.ingestor.apply_update(&ExecutionId::new("m-1"), &update).await;
    assert!(matches!(result, Err(IngestError::Unavailable(_))));

    let result = h
        .ingestor
        .report_completion(&ExecutionId::new("m-1"), Completion::Success)
        .await;
    assert!(matches!(result, Err(IngestError::Unavailable(_))));
}

/// Test: progress moves the job to `Running` and merges step state.
#[tokio::test]
async fn test_progress_updates_steps() {
    let h = Harness::in_memory().await;
    let execution_id = started(&h, "j1").await;

    let state = h
        .ingestor
        .report_progress(
            &execution_id,
            vec![StepProgress {
                index: 0,
                state: Some(StepState::Running),
                progress: Some(40.0),
                ..Default::default()
            }],
        )
        .await
        .unwrap();

    assert_eq!(state, JobState::Running);
    let job = h.job("j1").await;
    assert_eq!(job.step_details[0].state, StepState::Running);
    assert_eq!(job.step_details[0].progress, 40.0);
    assert_eq!(job.step_details[1].state, StepState::Waiting);
}

/// Test: a completion for a finished job is a conflict.
#[tokio::test]
async fn test_completion_after_finish_is_conflict() {
    let h = Harness::in_memory().await;
    let execution_id = started(&h, "j1").await;
    h.ingestor
        .report_completion(&execution_id, Completion::Success)
        .await
        .unwrap();

    let result = h
        .ingestor
        .report_completion(&execution_id, Completion::Success)
        .await;

    assert!(matches!(result, Err(IngestError::Conflict(_))));
    assert_eq!(h.state_of("j1").await, JobState::Done);
}

/// Test: cancelling an executing job flags it until its next touch-point.
#[tokio::test]
async fn test_cooperative_cancellation() {
    let h = Harness::in_memory().await;
    h.store.submit(fixture_job("j1", "export", "k1")).await.unwrap();
    h.admission.run_once().await.unwrap();
    h.driver.run_once(ExecutionKind::Main).await.unwrap();
    let execution_id = h.job("j1").await.executions.main.execution_id.unwrap();
    h.ingestor.report_progress(&execution_id, Vec::new()).await.unwrap();

    let outcome = h
        .ingestor
        .cancel(&JobId::new("j1"), Some("user-1".into()))
        .await
        .unwrap();
    assert_eq!(outcome, CancelOutcome::Flagged(JobState::Running));
    let job = h.job("j1").await;
    assert_eq!(job.state, JobState::Running);
    assert!(job.cancellation_info.is_cancelled);

    let state = h
        .ingestor
        .report_completion(&execution_id, Completion::Success)
        .await
        .unwrap();
    assert_eq!(state, JobState::Cancelled);

    let again = h.ingestor.cancel(&JobId::new("j1"), None).await.unwrap();
    assert_eq!(again, CancelOutcome::Unchanged(JobState::Cancelled));
}

/// Test: cancelling a job that was never admitted finishes it at once.
#[tokio::test]
async fn test_cancel_before_execution() {
    let h = Harness::in_memory().await;
    h.store.submit(fixture_job("j1", "train", "k1")).await.unwrap();

    let outcome = h.ingestor.cancel(&JobId::new("j1"), None).await.unwrap();

    assert_eq!(outcome, CancelOutcome::Cancelled);
    let job = h.job("j1").await;
    assert_eq!(job.state, JobState::Cancelled);
    assert!(job.end_time.is_some());

    let missing = h.ingestor.cancel(&JobId::new("nope"), None).await;
    assert!(matches!(missing, Err(IngestError::JobNotFound(_))));
}

/// Test: bulk deletion refuses an empty filter.
#[tokio::test]
async fn test_unfiltered_delete_is_refused() {
    let h = Harness::in_memory().await;
    h.store.submit(fixture_job("j1", "train", "k1")).await.unwrap();
    h.store.submit(fixture_job("j2", "train", "k2")).await.unwrap();

    let result = h.store.delete_many(&JobFilter::new()).await;
    assert!(matches!(result, Err(StorageError::UnfilteredDelete)));

    let deleted = h
        .store
        .delete_many(&JobFilter::new().with_id(JobId::new("j1")))
        .await
        .unwrap();
    assert_eq!(deleted, 1);
    assert!(h.store.get(&JobId::new("j2")).await.is_ok());
}

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::*;
    use geti_jobs::SqliteJobStore;

    /// Test: a closed connection pool maps to an unreachable database.
    #[tokio::test]
    async fn test_closed_pool_is_unavailable() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        store.submit(fixture_job("j1", "train", "k1")).await.unwrap();
        store.close().await;
        let h = Harness::new(Arc::new(store), test_config()).await;

        let result = h
            .ingestor
            .report_progress(&ExecutionId::new("m-1"), Vec::new())
            .await;

        assert!(matches!(result, Err(IngestError::Unavailable(_))));
    }
}
