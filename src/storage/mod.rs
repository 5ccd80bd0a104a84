//! Job storage abstraction.
//!
//! The [`JobStore`] trait is the single source of truth for job documents.
//! It deliberately exposes query and conditional-update primitives only;
//! jobs are created through the separate [`JobSubmitter`] trait used by
//! the submission path. Backends: in-memory and SQLite.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryJobStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteJobStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use thiserror::Error;

use crate::core::job::{
    CancellationInfo, ConsumedCost, ExecutionKind, FailureInfo, Job, StepDetail, StepProgress,
};
use crate::core::state::JobState;
use crate::core::types::{ExecutionId, JobId, OrganizationId, Tenant, WorkspaceId};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// The database cannot be reached.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A bulk delete was attempted without any filter.
    #[error("refusing to delete without an explicit filter")]
    UnfilteredDelete,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

impl StorageError {
    /// Whether the error means the database could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

/// Criteria selecting a set of jobs. Unset fields do not constrain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub ids: Option<Vec<JobId>>,
    pub states: Option<Vec<JobState>>,
    pub job_types: Option<Vec<String>>,
    pub keys: Option<Vec<String>>,
    pub organization_id: Option<OrganizationId>,
    pub workspace_id: Option<WorkspaceId>,
    pub is_cancelled: Option<bool>,
    pub gpu_reserved: Option<bool>,
    pub main_execution_id: Option<ExecutionId>,
    pub revert_execution_id: Option<ExecutionId>,
}

impl JobFilter {
    /// A filter matching every job.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ids(mut self, ids: impl IntoIterator<Item = JobId>) -> Self {
        self.ids = Some(ids.into_iter().collect());
        self
    }

    pub fn with_id(self, id: JobId) -> Self {
        self.with_ids([id])
    }

    pub fn with_states(mut self, states: impl IntoIterator<Item = JobState>) -> Self {
        self.states = Some(states.into_iter().collect());
        self
    }

    pub fn with_state(self, state: JobState) -> Self {
        self.with_states([state])
    }

    pub fn with_job_types<T: Into<String>>(mut self, types: impl IntoIterator<Item = T>) -> Self {
        self.job_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_keys<T: Into<String>>(mut self, keys: impl IntoIterator<Item = T>) -> Self {
        self.keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_organization(mut self, organization_id: OrganizationId) -> Self {
        self.organization_id = Some(organization_id);
        self
    }

    pub fn with_tenant(mut self, tenant: &Tenant) -> Self {
        self.organization_id = Some(tenant.organization_id.clone());
        self.workspace_id = Some(tenant.workspace_id.clone());
        self
    }

    pub fn cancelled(mut self, is_cancelled: bool) -> Self {
        self.is_cancelled = Some(is_cancelled);
        self
    }

    pub fn gpu_reserved(mut self, gpu_reserved: bool) -> Self {
        self.gpu_reserved = Some(gpu_reserved);
        self
    }

    pub fn with_execution_id(mut self, kind: ExecutionKind, execution_id: ExecutionId) -> Self {
        match kind {
            ExecutionKind::Main => self.main_execution_id = Some(execution_id),
            ExecutionKind::Revert => self.revert_execution_id = Some(execution_id),
        }
        self
    }

    /// Whether the filter constrains nothing.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Whether `job` satisfies every set criterion.
    pub fn matches(&self, job: &Job) -> bool {
        fn within<T: PartialEq>(set: &Option<Vec<T>>, value: &T) -> bool {
            set.as_ref().map_or(true, |s| s.contains(value))
        }
        fn equals<T: PartialEq>(expected: &Option<T>, value: &T) -> bool {
            expected.as_ref().map_or(true, |e| e == value)
        }

        within(&self.ids, &job.id)
            && within(&self.states, &job.state)
            && within(&self.job_types, &job.job_type)
            && within(&self.keys, &job.key)
            && equals(&self.organization_id, &job.organization_id)
            && equals(&self.workspace_id, &job.workspace_id)
            && equals(&self.is_cancelled, &job.cancellation_info.is_cancelled)
            && equals(&self.gpu_reserved, &job.gpu_reserved)
            && self
                .main_execution_id
                .as_ref()
                .map_or(true, |id| job.executions.main.execution_id.as_ref() == Some(id))
            && self
                .revert_execution_id
                .as_ref()
                .map_or(true, |id| job.executions.revert.execution_id.as_ref() == Some(id))
    }
}

/// Change to one execution's bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionPatch {
    /// `Some(None)` clears the handle.
    pub execution_id: Option<Option<ExecutionId>>,
    pub retry_counter: Option<RetryCounterChange>,
    pub flyte_launch_plan_id: Option<Option<String>>,
    pub last_start_error: Option<Option<String>>,
}

/// How a patch changes a start retry counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCounterChange {
    Increment,
    Reset,
}

impl ExecutionPatch {
    pub fn set_execution_id(mut self, execution_id: ExecutionId) -> Self {
        self.execution_id = Some(Some(execution_id));
        self
    }

    pub fn clear_execution_id(mut self) -> Self {
        self.execution_id = Some(None);
        self
    }

    pub fn increment_retry(mut self) -> Self {
        self.retry_counter = Some(RetryCounterChange::Increment);
        self
    }

    pub fn reset_retry(mut self) -> Self {
        self.retry_counter = Some(RetryCounterChange::Reset);
        self
    }

    pub fn set_launch_plan(mut self, launch_plan_id: impl Into<String>) -> Self {
        self.flyte_launch_plan_id = Some(Some(launch_plan_id.into()));
        self
    }

    pub fn set_start_error(mut self, error: impl Into<String>) -> Self {
        self.last_start_error = Some(Some(error.into()));
        self
    }

    pub fn clear_start_error(mut self) -> Self {
        self.last_start_error = Some(None);
        self
    }
}

/// A partial update of a job document.
///
/// Metadata entries overwrite existing keys, consumed costs and step
/// progress are merged into the existing values, everything else replaces.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub state: Option<JobState>,
    pub main_execution: Option<ExecutionPatch>,
    pub revert_execution: Option<ExecutionPatch>,
    pub step_details: Option<Vec<StepDetail>>,
    pub step_progress: Vec<StepProgress>,
    pub metadata: Option<Map<String, Value>>,
    pub cost_consumed: Vec<ConsumedCost>,
    pub gpu_reserved: Option<bool>,
    pub cancellation_info: Option<CancellationInfo>,
    pub failure: Option<FailureInfo>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_execution(mut self, kind: ExecutionKind, patch: ExecutionPatch) -> Self {
        match kind {
            ExecutionKind::Main => self.main_execution = Some(patch),
            ExecutionKind::Revert => self.revert_execution = Some(patch),
        }
        self
    }

    pub fn with_step_details(mut self, steps: Vec<StepDetail>) -> Self {
        self.step_details = Some(steps);
        self
    }

    pub fn with_step_progress(mut self, progress: Vec<StepProgress>) -> Self {
        self.step_progress = progress;
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_cost_consumed(mut self, consumed: Vec<ConsumedCost>) -> Self {
        self.cost_consumed = consumed;
        self
    }

    pub fn with_gpu_reserved(mut self, reserved: bool) -> Self {
        self.gpu_reserved = Some(reserved);
        self
    }

    pub fn with_cancellation(mut self, info: CancellationInfo) -> Self {
        self.cancellation_info = Some(info);
        self
    }

    pub fn with_failure(mut self, failure: FailureInfo) -> Self {
        self.failure = Some(failure);
        self
    }

    pub fn with_start_time(mut self, time: DateTime<Utc>) -> Self {
        self.start_time = Some(time);
        self
    }

    pub fn with_end_time(mut self, time: DateTime<Utc>) -> Self {
        self.end_time = Some(time);
        self
    }

    /// Apply the patch to a job document in place.
    pub fn apply(&self, job: &mut Job) {
        if let Some(state) = self.state {
            job.state = state;
        }
        for (kind, patch) in [
            (ExecutionKind::Main, &self.main_execution),
            (ExecutionKind::Revert, &self.revert_execution),
        ] {
            let Some(patch) = patch else { continue };
            let info = job.executions.get_mut(kind);
            if let Some(execution_id) = &patch.execution_id {
                info.execution_id = execution_id.clone();
            }
            match patch.retry_counter {
                Some(RetryCounterChange::Increment) => info.start_retry_counter += 1,
                Some(RetryCounterChange::Reset) => info.start_retry_counter = 0,
                None => {}
            }
            if let Some(launch_plan) = &patch.flyte_launch_plan_id {
                info.flyte_launch_plan_id = launch_plan.clone();
            }
            if let Some(error) = &patch.last_start_error {
                info.last_start_error = error.clone();
            }
        }
        if let Some(steps) = &self.step_details {
            job.step_details = steps.clone();
        }
        if !self.step_progress.is_empty() {
            job.merge_step_progress(&self.step_progress);
        }
        if let Some(metadata) = &self.metadata {
            for (key, value) in metadata {
                job.metadata.insert(key.clone(), value.clone());
            }
        }
        job.cost.consumed.extend(self.cost_consumed.iter().cloned());
        if let Some(reserved) = self.gpu_reserved {
            job.gpu_reserved = reserved;
        }
        if let Some(info) = &self.cancellation_info {
            job.cancellation_info = info.clone();
        }
        if let Some(failure) = &self.failure {
            job.failure = Some(failure.clone());
        }
        if let Some(time) = self.start_time {
            job.start_time = Some(time);
        }
        if let Some(time) = self.end_time {
            job.end_time = Some(time);
        }
    }
}

/// Ordering of `find`/`find_one` results by creation time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FindOrder {
    /// Storage order.
    #[default]
    None,
    /// Most recently created first.
    Latest,
    /// Least recently created first.
    Earliest,
}

/// Grouping and counting queries used by the admission engine and the
/// recovery loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregation {
    /// Distinct types of submitted, non-cancelled jobs.
    SubmittedJobTypes,
    /// Distinct organizations with submitted, non-cancelled jobs of the given types.
    SubmittedOrganizations { job_types: Vec<String> },
    /// Number of jobs matching a filter.
    Count(JobFilter),
    /// Submitted jobs eligible for admission, in scheduling order.
    ///
    /// Excludes cancelled jobs and jobs whose key is held by another
    /// in-flight, non-cancelled job; at most one job per key is returned.
    AdmissionCandidates {
        job_types: Vec<String>,
        organization_id: Option<OrganizationId>,
        limit: usize,
    },
    /// Distinct tenants owning at least one non-terminal job.
    ActiveTenants,
}

/// One row of an aggregation result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateRow {
    JobType(String),
    Organization(OrganizationId),
    Count(u64),
    Candidate(JobId),
    Tenant(Tenant),
}

/// Ready state and lock state of the `kind` execution's find-and-lock.
pub fn lock_states(kind: ExecutionKind) -> (JobState, JobState) {
    match kind {
        ExecutionKind::Main => (JobState::ReadyForScheduling, JobState::Scheduling),
        ExecutionKind::Revert => (JobState::ReadyForRevert, JobState::RevertScheduling),
    }
}

/// Order in which ready jobs are locked and submitted jobs admitted:
/// priority descending, then creation time ascending.
pub fn scheduling_order(a: &Job, b: &Job) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.creation_time.cmp(&b.creation_time))
        .then_with(|| a.id.cmp(&b.id))
}

/// Storage trait for job documents.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Get a job by ID.
    async fn get(&self, id: &JobId) -> Result<Job, StorageError>;

    /// Get at most one job matching the filter.
    async fn find_one(&self, filter: &JobFilter, order: FindOrder)
    -> Result<Option<Job>, StorageError>;

    /// List jobs matching the filter, returning at most `limit` jobs.
    async fn find(
        &self,
        filter: &JobFilter,
        order: FindOrder,
        limit: Option<usize>,
    ) -> Result<Vec<Job>, StorageError>;

    /// Atomically move the next ready job to `Scheduling` and return it.
    async fn find_and_lock_for_scheduling(&self) -> Result<Option<Job>, StorageError>;

    /// Atomically move the next job ready for revert to `RevertScheduling` and return it.
    async fn find_and_lock_for_reverting(&self) -> Result<Option<Job>, StorageError>;

    /// Apply a patch to one job.
    ///
    /// When `expected_state` is given the patch only applies if the job is
    /// currently in that state; `Ok(false)` reports the mismatch.
    async fn update(
        &self,
        id: &JobId,
        patch: &JobPatch,
        expected_state: Option<JobState>,
    ) -> Result<bool, StorageError>;

    /// Apply a patch to every job matching the filter, returning the updated ids.
    async fn update_many(
        &self,
        filter: &JobFilter,
        patch: &JobPatch,
    ) -> Result<Vec<JobId>, StorageError>;

    /// Run a grouping or counting query.
    async fn aggregate(&self, aggregation: &Aggregation) -> Result<Vec<AggregateRow>, StorageError>;

    /// Delete every job matching the filter. An empty filter is rejected.
    async fn delete_many(&self, filter: &JobFilter) -> Result<u64, StorageError>;
}

/// Write primitive of the job submission path.
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    /// Persist a new job.
    async fn submit(&self, job: Job) -> Result<(), StorageError>;
}

/// Extract the count of a [`Aggregation::Count`] result.
pub fn count_of(rows: &[AggregateRow]) -> u64 {
    rows.iter()
        .find_map(|row| match row {
            AggregateRow::Count(n) => Some(*n),
            _ => None,
        })
        .unwrap_or(0)
}
