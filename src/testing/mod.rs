//! Testing utilities for users of the geti-jobs library.
//!
//! This module provides helpers for testing the scheduler without a real
//! workflow engine or database:
//!
//! - [`FakeWorkflowEngine`]: An in-process engine with failure injection
//! - [`RecordingHandler`]: An event handler that keeps every event
//! - [`UnavailableJobStore`]: A store whose database is always down
//! - [`FlakyJobStore`]: An in-memory store that fails chosen state writes once
//! - [`fixture_job`]: A submitted job with fixed tenant and id

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

use crate::core::job::Job;
use crate::core::state::JobState;
use crate::core::types::{ExecutionId, JobId, Tenant};
use crate::events::{Event, EventError, EventHandler};
use crate::storage::{
    AggregateRow, Aggregation, FindOrder, InMemoryJobStore, JobFilter, JobPatch, JobStore,
    JobSubmitter, StorageError,
};
use crate::workflow::{
    ExecutionHandle, ExecutionPhase, StartRequest, WorkflowDef, WorkflowEngine, WorkflowError,
};

/// Organization of jobs created by [`fixture_job`].
pub const FIXTURE_ORGANIZATION: &str = "org-test";

/// Workspace of jobs created by [`fixture_job`].
pub const FIXTURE_WORKSPACE: &str = "ws-test";

/// A submitted job of `job_type` with the given id and de-duplication key.
///
/// ```
/// use geti_jobs::testing::fixture_job;
///
/// let job = fixture_job("job-1", "train", "project-1");
/// assert_eq!(job.id.as_str(), "job-1");
/// ```
pub fn fixture_job(id: &str, job_type: &str, key: &str) -> Job {
    Job::new(
        job_type,
        key,
        Tenant::new(FIXTURE_ORGANIZATION, FIXTURE_WORKSPACE),
    )
    .with_id(id)
}

/// An in-process workflow engine.
///
/// Every workflow exists unless hidden, and started executions are kept
/// until dropped, so tests can simulate a lost execution.
#[derive(Default)]
pub struct FakeWorkflowEngine {
    state: Mutex<FakeEngineState>,
}

#[derive(Default)]
struct FakeEngineState {
    hidden_workflows: HashSet<String>,
    executions: HashMap<ExecutionId, ExecutionHandle>,
    start_failures_remaining: u32,
    start_calls: u32,
    unavailable: bool,
}

impl FakeWorkflowEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `fetch_workflow` report the named workflow as missing.
    pub async fn hide_workflow(&self, name: impl Into<String>) {
        self.state.lock().await.hidden_workflows.insert(name.into());
    }

    /// Make the next `times` calls to `start_execution` fail.
    pub async fn fail_starts(&self, times: u32) {
        self.state.lock().await.start_failures_remaining = times;
    }

    /// Make every call fail as if the engine could not be reached.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Forget an execution, as if it had been purged from the engine.
    pub async fn drop_execution(&self, execution_id: &ExecutionId) {
        self.state.lock().await.executions.remove(execution_id);
    }

    /// Register an execution that was started outside the scheduler.
    pub async fn insert_execution(&self, execution_id: ExecutionId, phase: ExecutionPhase) {
        self.state.lock().await.executions.insert(
            execution_id.clone(),
            ExecutionHandle {
                execution_id,
                phase,
            },
        );
    }

    /// Number of `start_execution` calls, including failed ones.
    pub async fn start_count(&self) -> u32 {
        self.state.lock().await.start_calls
    }

    /// Names of the executions currently known to the engine.
    pub async fn execution_ids(&self) -> Vec<ExecutionId> {
        let mut ids: Vec<ExecutionId> =
            self.state.lock().await.executions.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn unavailable() -> WorkflowError {
    WorkflowError::Unavailable("fake engine is down".to_string())
}

#[async_trait]
impl WorkflowEngine for FakeWorkflowEngine {
    async fn fetch_workflow(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<WorkflowDef>, WorkflowError> {
        let state = self.state.lock().await;
        if state.unavailable {
            return Err(unavailable());
        }
        if state.hidden_workflows.contains(name) {
            return Ok(None);
        }
        Ok(Some(WorkflowDef {
            name: name.to_string(),
            version: version.to_string(),
            launch_plan_id: format!("fake:{}:{}", name, version),
        }))
    }

    async fn fetch_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<ExecutionHandle>, WorkflowError> {
        let state = self.state.lock().await;
        if state.unavailable {
            return Err(unavailable());
        }
        Ok(state.executions.get(execution_id).cloned())
    }

    async fn start_execution(&self, request: StartRequest) -> Result<ExecutionHandle, WorkflowError> {
        let mut state = self.state.lock().await;
        state.start_calls += 1;
        if state.unavailable {
            return Err(unavailable());
        }
        if state.start_failures_remaining > 0 {
            state.start_failures_remaining -= 1;
            return Err(WorkflowError::Rejected {
                status: 500,
                message: "injected start failure".to_string(),
            });
        }
        let handle = ExecutionHandle {
            execution_id: request.execution_id.clone(),
            phase: ExecutionPhase::Queued,
        };
        state
            .executions
            .insert(request.execution_id, handle.clone());
        Ok(handle)
    }

    async fn list_executions(
        &self,
        execution_ids: &[ExecutionId],
    ) -> Result<Vec<ExecutionHandle>, WorkflowError> {
        let state = self.state.lock().await;
        if state.unavailable {
            return Err(unavailable());
        }
        Ok(execution_ids
            .iter()
            .filter_map(|id| state.executions.get(id).cloned())
            .collect())
    }
}

/// Event handler that records every event it receives.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events received so far, in delivery order.
    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    /// The `(from, to)` pairs of every state change received so far.
    pub async fn state_changes(&self) -> Vec<(JobState, JobState)> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|event| match event {
                Event::JobStateChanged { from, to, .. } => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }

    pub async fn clear(&self) {
        self.events.lock().await.clear();
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) -> Result<(), EventError> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

/// A job store whose database can never be reached.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableJobStore;

fn down() -> StorageError {
    StorageError::Unavailable("connection refused".to_string())
}

#[async_trait]
impl JobStore for UnavailableJobStore {
    async fn get(&self, _id: &JobId) -> Result<Job, StorageError> {
        Err(down())
    }

    async fn find_one(
        &self,
        _filter: &JobFilter,
        _order: FindOrder,
    ) -> Result<Option<Job>, StorageError> {
        Err(down())
    }

    async fn find(
        &self,
        _filter: &JobFilter,
        _order: FindOrder,
        _limit: Option<usize>,
    ) -> Result<Vec<Job>, StorageError> {
        Err(down())
    }

    async fn find_and_lock_for_scheduling(&self) -> Result<Option<Job>, StorageError> {
        Err(down())
    }

    async fn find_and_lock_for_reverting(&self) -> Result<Option<Job>, StorageError> {
        Err(down())
    }

    async fn update(
        &self,
        _id: &JobId,
        _patch: &JobPatch,
        _expected_state: Option<JobState>,
    ) -> Result<bool, StorageError> {
        Err(down())
    }

    async fn update_many(
        &self,
        _filter: &JobFilter,
        _patch: &JobPatch,
    ) -> Result<Vec<JobId>, StorageError> {
        Err(down())
    }

    async fn aggregate(&self, _aggregation: &Aggregation) -> Result<Vec<AggregateRow>, StorageError> {
        Err(down())
    }

    async fn delete_many(&self, _filter: &JobFilter) -> Result<u64, StorageError> {
        Err(down())
    }
}

/// An in-memory job store that fails selected state writes.
///
/// Each call to [`FlakyJobStore::fail_next_write`] makes the next `update`
/// that moves a job to that state fail once as unavailable. Reads and
/// every other write go to the wrapped store.
#[derive(Default)]
pub struct FlakyJobStore {
    inner: InMemoryJobStore,
    failing: Mutex<Vec<JobState>>,
}

impl FlakyJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next write that moves a job to `state`.
    pub async fn fail_next_write(&self, state: JobState) {
        self.failing.lock().await.push(state);
    }

    /// Injected failures that have not fired yet.
    pub async fn pending_failures(&self) -> usize {
        self.failing.lock().await.len()
    }
}

#[async_trait]
impl JobStore for FlakyJobStore {
    async fn get(&self, id: &JobId) -> Result<Job, StorageError> {
        self.inner.get(id).await
    }

    async fn find_one(
        &self,
        filter: &JobFilter,
        order: FindOrder,
    ) -> Result<Option<Job>, StorageError> {
        self.inner.find_one(filter, order).await
    }

    async fn find(
        &self,
        filter: &JobFilter,
        order: FindOrder,
        limit: Option<usize>,
    ) -> Result<Vec<Job>, StorageError> {
        self.inner.find(filter, order, limit).await
    }

    async fn find_and_lock_for_scheduling(&self) -> Result<Option<Job>, StorageError> {
        self.inner.find_and_lock_for_scheduling().await
    }

    async fn find_and_lock_for_reverting(&self) -> Result<Option<Job>, StorageError> {
        self.inner.find_and_lock_for_reverting().await
    }

    async fn update(
        &self,
        id: &JobId,
        patch: &JobPatch,
        expected_state: Option<JobState>,
    ) -> Result<bool, StorageError> {
        if let Some(state) = patch.state {
            let mut failing = self.failing.lock().await;
            if let Some(pos) = failing.iter().position(|s| *s == state) {
                failing.remove(pos);
                return Err(StorageError::Unavailable(format!(
                    "write to {} failed",
                    state
                )));
            }
        }
        self.inner.update(id, patch, expected_state).await
    }

    async fn update_many(
        &self,
        filter: &JobFilter,
        patch: &JobPatch,
    ) -> Result<Vec<JobId>, StorageError> {
        self.inner.update_many(filter, patch).await
    }

    async fn aggregate(&self, aggregation: &Aggregation) -> Result<Vec<AggregateRow>, StorageError> {
        self.inner.aggregate(aggregation).await
    }

    async fn delete_many(&self, filter: &JobFilter) -> Result<u64, StorageError> {
        self.inner.delete_many(filter).await
    }
}

#[async_trait]
impl JobSubmitter for FlakyJobStore {
    async fn submit(&self, job: Job) -> Result<(), StorageError> {
        self.inner.submit(job).await
    }
}
