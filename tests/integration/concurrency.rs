//! Concurrency tests.
//!
//! Several scheduler instances share one store. Every ready job must be
//! locked and started by exactly one of them.

use crate::common::Harness;

use geti_jobs::testing::fixture_job;
use geti_jobs::{
    ExecutionDriver, ExecutionKind, InMemoryJobStore, JobId, JobState, JobStore, JobSubmitter,
    ScheduleOutcome,
};
use std::collections::HashSet;
use std::sync::Arc;

const JOBS: usize = 40;
const INSTANCES: usize = 4;

async fn submit_ready<S: JobSubmitter>(store: &S) {
    for i in 0..JOBS {
        let id = format!("job-{:02}", i);
        store
            .submit(fixture_job(&id, "train", &id).with_state(JobState::ReadyForScheduling))
            .await
            .unwrap();
    }
}

/// Lock jobs from `INSTANCES` concurrent tasks until the store runs dry.
async fn lock_concurrently<S: JobStore + 'static>(store: Arc<S>) -> Vec<JobId> {
    let mut tasks = Vec::new();
    for _ in 0..INSTANCES {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let mut locked = Vec::new();
            while let Some(job) = store.find_and_lock_for_scheduling().await.unwrap() {
                assert_eq!(job.state, JobState::Scheduling);
                locked.push(job.id);
                tokio::task::yield_now().await;
            }
            locked
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }
    all
}

fn assert_each_once(ids: &[JobId]) {
    let unique: HashSet<&JobId> = ids.iter().collect();
    assert_eq!(unique.len(), ids.len(), "a job was locked twice");
    assert_eq!(ids.len(), JOBS);
}

/// Test: concurrent lockers never return the same job.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_locking_in_memory() {
    let store = Arc::new(InMemoryJobStore::new());
    submit_ready(store.as_ref()).await;

    let locked = lock_concurrently(store.clone()).await;

    assert_each_once(&locked);
    let remaining = store
        .find(
            &geti_jobs::JobFilter::new().with_state(JobState::ReadyForScheduling),
            geti_jobs::storage::FindOrder::None,
            None,
        )
        .await
        .unwrap();
    assert!(remaining.is_empty());
}

/// Test: racing drivers start one execution per job.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_drivers_start_each_job_once() {
    let h = Harness::in_memory().await;
    submit_ready(h.store.as_ref()).await;

    let mut tasks = Vec::new();
    for _ in 0..INSTANCES {
        let driver = Arc::new(ExecutionDriver::new(
            h.state_machine.clone(),
            h.engine.clone(),
            &h.config,
        ));
        tasks.push(tokio::spawn(async move {
            let mut scheduled = Vec::new();
            loop {
                match driver.schedule_next().await.unwrap() {
                    ScheduleOutcome::Idle => break,
                    ScheduleOutcome::Scheduled { job_id, .. } => scheduled.push(job_id),
                    other => panic!("unexpected outcome: {:?}", other),
                }
            }
            scheduled
        }));
    }

    let mut scheduled = Vec::new();
    for task in tasks {
        scheduled.extend(task.await.unwrap());
    }

    assert_each_once(&scheduled);
    assert_eq!(h.engine.start_count().await as usize, JOBS);
    assert_eq!(h.engine.execution_ids().await.len(), JOBS);
    for id in &scheduled {
        assert_eq!(h.store.get(id).await.unwrap().state, JobState::Scheduled);
    }
}

/// Test: admission and scheduling running side by side keep the graph legal.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_admission_and_scheduling_interleave() {
    let h = Arc::new(Harness::in_memory().await);
    for i in 0..10 {
        let id = format!("s-{}", i);
        h.store.submit(fixture_job(&id, "train", &id)).await.unwrap();
    }

    let admitting = {
        let h = h.clone();
        tokio::spawn(async move {
            for _ in 0..5 {
                h.admission.run_once().await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };
    let scheduling = {
        let h = h.clone();
        tokio::spawn(async move {
            for _ in 0..20 {
                h.driver.run_once(ExecutionKind::Main).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };
    admitting.await.unwrap();
    scheduling.await.unwrap();
    h.driver.run_once(ExecutionKind::Main).await.unwrap();

    for (from, to) in h.events.state_changes().await {
        assert!(from.can_transition_to(to), "illegal transition {} -> {}", from, to);
    }
    for i in 0..10 {
        assert_eq!(h.state_of(&format!("s-{}", i)).await, JobState::Scheduled);
    }
}

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::*;
    use geti_jobs::SqliteJobStore;

    /// Test: the SQLite lock is atomic across connections.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_locking_in_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteJobStore::new(dir.path().join("jobs.db")).await.unwrap());
        submit_ready(store.as_ref()).await;

        let locked = lock_concurrently(store).await;

        assert_each_once(&locked);
    }
}
