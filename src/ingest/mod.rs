//! Ingestion of updates sent by running workloads.
//!
//! Running executions report back through a narrow interface: free-form
//! updates (metadata, consumed cost, GPU release), step progress and the
//! final completion signal. Jobs are located by the execution id the
//! scheduler recorded when it started the execution. Failures are mapped
//! to [`IngestError`] variants that callers can tell apart, in particular
//! an unknown execution and an unreachable database.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{RevertTrigger, SchedulerConfig};
use crate::core::job::{ConsumedCost, ExecutionKind, Job, StepProgress};
use crate::core::state::{JobState, MAIN_EXECUTION_STATES, REVERT_EXECUTION_STATES};
use crate::core::types::{ExecutionId, JobId, UserId};
use crate::lifecycle::{CancelOutcome, Completion, StateMachine, TransitionError};
use crate::storage::{FindOrder, JobFilter, JobPatch, JobStore, StorageError};

/// Attempts to apply a progress or completion report while the job changes.
const MAX_REPORT_ATTEMPTS: usize = 3;

/// Errors returned to the sender of an update.
#[derive(Debug, Error)]
pub enum IngestError {
    /// No job owns the execution.
    #[error("execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// The database cannot be reached; the sender should retry later.
    #[error("database unavailable: {0}")]
    Unavailable(String),

    #[error("invalid update: {0}")]
    Invalid(String),

    /// The job is in a state that does not accept the update.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StorageError> for IngestError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Unavailable(msg) => IngestError::Unavailable(msg),
            other => IngestError::Internal(other.to_string()),
        }
    }
}

impl From<TransitionError> for IngestError {
    fn from(e: TransitionError) -> Self {
        match e {
            TransitionError::Storage(e) => e.into(),
            other => IngestError::Conflict(other.to_string()),
        }
    }
}

/// GPU reservation change requested by a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuAction {
    #[serde(alias = "RELEASE")]
    Release,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuUpdate {
    pub action: GpuAction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostUpdate {
    #[serde(default)]
    pub consumed: Vec<ConsumedCost>,
}

/// A free-form update from a running workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobUpdate {
    /// Entries merged into the job metadata, overwriting existing keys.
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default)]
    pub cost: Option<CostUpdate>,
    #[serde(default)]
    pub gpu: Option<GpuUpdate>,
}

impl JobUpdate {
    pub fn is_empty(&self) -> bool {
        self.metadata.is_none()
            && self.cost.as_ref().map_or(true, |c| c.consumed.is_empty())
            && self.gpu.is_none()
    }

    fn to_patch(&self) -> JobPatch {
        let mut patch = JobPatch::new();
        if let Some(metadata) = &self.metadata {
            patch = patch.with_metadata(metadata.clone());
        }
        if let Some(cost) = &self.cost {
            patch = patch.with_cost_consumed(cost.consumed.clone());
        }
        if let Some(GpuUpdate {
            action: GpuAction::Release,
        }) = self.gpu
        {
            patch = patch.with_gpu_reserved(false);
        }
        patch
    }
}

/// Applies workload reports to jobs.
pub struct UpdateIngestor<S: JobStore> {
    store: Arc<S>,
    state_machine: Arc<StateMachine<S>>,
    triggers: HashMap<String, RevertTrigger>,
}

impl<S: JobStore> UpdateIngestor<S> {
    pub fn new(state_machine: Arc<StateMachine<S>>, config: &SchedulerConfig) -> Self {
        Self {
            store: state_machine.store().clone(),
            state_machine,
            triggers: config
                .job_types
                .iter()
                .map(|t| (t.job_type.clone(), t.revert_trigger()))
                .collect(),
        }
    }

    /// The job owning an execution, and which of its executions it is.
    pub async fn locate(&self, execution_id: &ExecutionId) -> Result<(Job, ExecutionKind), IngestError> {
        for kind in [ExecutionKind::Main, ExecutionKind::Revert] {
            let filter = JobFilter::new().with_execution_id(kind, execution_id.clone());
            if let Some(job) = self.store.find_one(&filter, FindOrder::Latest).await? {
                return Ok((job, kind));
            }
        }
        Err(IngestError::ExecutionNotFound(execution_id.clone()))
    }

    /// Apply metadata, consumed cost and GPU changes.
    pub async fn apply_update(
        &self,
        execution_id: &ExecutionId,
        update: &JobUpdate,
    ) -> Result<JobId, IngestError> {
        if update.is_empty() {
            return Err(IngestError::Invalid("update carries no changes".to_string()));
        }
        let (job, _) = self.locate(execution_id).await?;
        match self.store.update(&job.id, &update.to_patch(), None).await {
            Ok(_) => {}
            Err(StorageError::NotFound(_)) => {
                return Err(IngestError::ExecutionNotFound(execution_id.clone()))
            }
            Err(e) => return Err(e.into()),
        }
        if update.gpu.is_some() {
            tracing::info!(job_id = %job.id, execution_id = %execution_id, "gpu reservation released");
        } else {
            tracing::debug!(job_id = %job.id, execution_id = %execution_id, "job update applied");
        }
        Ok(job.id)
    }

    /// Merge step progress; moves the job to its running state.
    pub async fn report_progress(
        &self,
        execution_id: &ExecutionId,
        progress: Vec<StepProgress>,
    ) -> Result<JobState, IngestError> {
        for _ in 0..MAX_REPORT_ATTEMPTS {
            let (job, kind) = self.locate(execution_id).await?;
            Self::check_executing(&job, kind)?;
            if self
                .state_machine
                .record_progress(&job, kind, progress.clone())
                .await?
            {
                return Ok(self.store.get(&job.id).await?.state);
            }
        }
        Err(IngestError::Conflict(format!(
            "job of execution {} kept changing",
            execution_id
        )))
    }

    /// Apply the final result of an execution.
    pub async fn report_completion(
        &self,
        execution_id: &ExecutionId,
        completion: Completion,
    ) -> Result<JobState, IngestError> {
        for _ in 0..MAX_REPORT_ATTEMPTS {
            let (job, kind) = self.locate(execution_id).await?;
            Self::check_executing(&job, kind)?;
            let trigger = self.triggers.get(&job.job_type).copied().unwrap_or_default();
            if let Some(state) = self
                .state_machine
                .complete(&job, kind, &completion, trigger)
                .await?
            {
                tracing::info!(job_id = %job.id, kind = %kind, state = %state, "execution completed");
                return Ok(state);
            }
        }
        Err(IngestError::Conflict(format!(
            "job of execution {} kept changing",
            execution_id
        )))
    }

    /// Request cancellation of a job.
    pub async fn cancel(
        &self,
        job_id: &JobId,
        user_id: Option<UserId>,
    ) -> Result<CancelOutcome, IngestError> {
        match self.state_machine.cancel(job_id, user_id).await {
            Ok(outcome) => Ok(outcome),
            Err(TransitionError::Storage(StorageError::NotFound(_))) => {
                Err(IngestError::JobNotFound(job_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn check_executing(job: &Job, kind: ExecutionKind) -> Result<(), IngestError> {
        let states = match kind {
            ExecutionKind::Main => MAIN_EXECUTION_STATES,
            ExecutionKind::Revert => REVERT_EXECUTION_STATES,
        };
        if states.contains(&job.state) {
            Ok(())
        } else {
            Err(IngestError::Conflict(format!(
                "job {} is {} and does not accept {} execution reports",
                job.id, job.state, kind
            )))
        }
    }
}
