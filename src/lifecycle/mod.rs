//! The job state machine.
//!
//! [`StateMachine`] is the only component that writes a job's `state`.
//! Every transition is checked against the lifecycle graph, written with a
//! conditional store update on the state the caller observed, and only
//! published as an event once the write has been confirmed.

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;

use crate::config::RevertTrigger;
use crate::core::job::{CancellationInfo, ExecutionKind, FailureInfo, Job, StepDetail, StepProgress};
use crate::core::state::{JobState, MAIN_EXECUTION_STATES};
use crate::core::types::{ExecutionId, JobId, UserId};
use crate::events::{Event, EventBus};
use crate::storage::{ExecutionPatch, JobFilter, JobPatch, JobStore, StorageError};
use crate::storage::FindOrder;

/// Attempts to apply a cancellation while the job keeps changing state.
const MAX_CANCEL_ATTEMPTS: usize = 8;

/// Errors raised by state transitions.
#[derive(Debug, Error)]
pub enum TransitionError {
    /// The requested edge is not part of the lifecycle graph.
    #[error("illegal transition for job {job_id}: {from} -> {to}")]
    Illegal {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },

    /// The job does not accept cancellation.
    #[error("job {0} is not cancellable")]
    NotCancellable(JobId),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result reported by the external workflow when an execution ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Success,
    Failure { message: String },
}

/// What a cancellation request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job had not started and is now cancelled.
    Cancelled,
    /// The job is executing; it was flagged and will finish as cancelled.
    Flagged(JobState),
    /// The job was already cancelled or finished.
    Unchanged(JobState),
}

/// Authoritative writer of job lifecycle states.
pub struct StateMachine<S: JobStore> {
    store: Arc<S>,
    events: Arc<EventBus>,
}

impl<S: JobStore> StateMachine<S> {
    pub fn new(store: Arc<S>, events: Arc<EventBus>) -> Self {
        Self { store, events }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Move `job` from its observed state to `to`, applying `patch` in the same write.
    ///
    /// Returns `Ok(false)` when the job's state changed since it was read.
    async fn transition(
        &self,
        job: &Job,
        to: JobState,
        patch: JobPatch,
    ) -> Result<bool, TransitionError> {
        let from = job.state;
        if !from.can_transition_to(to) {
            return Err(TransitionError::Illegal {
                job_id: job.id.clone(),
                from,
                to,
            });
        }

        let mut patch = patch.with_state(to);
        if to.is_terminal() {
            patch = patch.with_gpu_reserved(false).with_end_time(Utc::now());
        }

        let applied = self.store.update(&job.id, &patch, Some(from)).await?;
        if applied {
            tracing::debug!(job_id = %job.id, from = %from, to = %to, "job transitioned");
            if from != to {
                self.events.emit(Event::state_changed(job, from, to)).await;
            }
        } else {
            tracing::debug!(job_id = %job.id, from = %from, to = %to, "job changed concurrently, transition skipped");
        }
        Ok(applied)
    }

    /// Lock the next job ready for scheduling.
    pub async fn lock_for_scheduling(&self) -> Result<Option<Job>, TransitionError> {
        let job = self.store.find_and_lock_for_scheduling().await?;
        if let Some(job) = &job {
            self.events
                .emit(Event::state_changed(job, JobState::ReadyForScheduling, JobState::Scheduling))
                .await;
        }
        Ok(job)
    }

    /// Lock the next job ready for revert.
    pub async fn lock_for_reverting(&self) -> Result<Option<Job>, TransitionError> {
        let job = self.store.find_and_lock_for_reverting().await?;
        if let Some(job) = &job {
            self.events
                .emit(Event::state_changed(job, JobState::ReadyForRevert, JobState::RevertScheduling))
                .await;
        }
        Ok(job)
    }

    /// Promote submitted jobs to `ReadyForScheduling`.
    ///
    /// The write is guarded by the admission filter, so jobs that were
    /// cancelled or moved on since selection are skipped. Returns the
    /// ids actually promoted.
    pub async fn promote(
        &self,
        ids: &[JobId],
        reserve_gpu: bool,
    ) -> Result<Vec<JobId>, TransitionError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let filter = JobFilter::new()
            .with_ids(ids.iter().cloned())
            .with_state(JobState::Submitted)
            .cancelled(false);
        let mut patch = JobPatch::new().with_state(JobState::ReadyForScheduling);
        if reserve_gpu {
            patch = patch.with_gpu_reserved(true);
        }

        let promoted = self.store.update_many(&filter, &patch).await?;
        if !promoted.is_empty() {
            let jobs = self
                .store
                .find(&JobFilter::new().with_ids(promoted.iter().cloned()), FindOrder::None, None)
                .await?;
            for job in &jobs {
                self.events
                    .emit(Event::state_changed(job, JobState::Submitted, JobState::ReadyForScheduling))
                    .await;
            }
        }
        Ok(promoted)
    }

    /// Record a started (or reused) execution of a locked job.
    pub async fn mark_scheduled(
        &self,
        job: &Job,
        kind: ExecutionKind,
        execution_id: ExecutionId,
        launch_plan_id: &str,
        steps: Vec<StepDetail>,
        reused: bool,
    ) -> Result<bool, TransitionError> {
        let execution = ExecutionPatch::default()
            .set_execution_id(execution_id.clone())
            .set_launch_plan(launch_plan_id)
            .clear_start_error();
        let mut patch = JobPatch::new().with_execution(kind, execution);
        let to = match kind {
            ExecutionKind::Main => {
                patch = patch.with_step_details(steps).with_start_time(Utc::now());
                JobState::Scheduled
            }
            ExecutionKind::Revert => JobState::RevertScheduled,
        };

        let applied = self.transition(job, to, patch).await?;
        if applied {
            self.events
                .emit(Event::execution_started(job.id.clone(), kind, execution_id, reused))
                .await;
        }
        Ok(applied)
    }

    /// Return a locked job to its ready state after a failed start attempt.
    pub async fn release_lock(
        &self,
        job: &Job,
        kind: ExecutionKind,
        error: &str,
    ) -> Result<bool, TransitionError> {
        let patch = JobPatch::new().with_execution(
            kind,
            ExecutionPatch::default().increment_retry().set_start_error(error),
        );
        let to = match kind {
            ExecutionKind::Main => JobState::ReadyForScheduling,
            ExecutionKind::Revert => JobState::ReadyForRevert,
        };
        self.transition(job, to, patch).await
    }

    /// Finish a locked job whose start retries are exhausted.
    pub async fn finish_exhausted(
        &self,
        job: &Job,
        kind: ExecutionKind,
    ) -> Result<Option<JobState>, TransitionError> {
        let info = job.execution(kind);
        let to = if job.is_cancelled() {
            JobState::Cancelled
        } else {
            JobState::Failed
        };
        let mut message = format!(
            "could not start the {} workflow after {} attempts",
            kind, info.start_retry_counter
        );
        if let Some(error) = &info.last_start_error {
            message = format!("{}: {}", message, error);
        }

        let patch = JobPatch::new().with_failure(FailureInfo::platform(message));
        if !self.transition(job, to, patch).await? {
            return Ok(None);
        }
        self.events
            .emit(Event::retry_exhausted(job.id.clone(), kind, info.start_retry_counter))
            .await;
        Ok(Some(to))
    }

    /// Finish a locked job that was cancelled before its execution started.
    pub async fn finish_cancelled(&self, job: &Job) -> Result<bool, TransitionError> {
        self.transition(job, JobState::Cancelled, JobPatch::new()).await
    }

    /// Merge step progress reported by a running execution.
    ///
    /// A main execution moves the job to `Running` unless the job has been
    /// cancelled, in which case only the progress is recorded.
    pub async fn record_progress(
        &self,
        job: &Job,
        kind: ExecutionKind,
        progress: Vec<StepProgress>,
    ) -> Result<bool, TransitionError> {
        let to = match (kind, job.state) {
            (ExecutionKind::Main, JobState::Scheduled) if job.is_cancelled() => JobState::Scheduled,
            (ExecutionKind::Main, _) => JobState::Running,
            (ExecutionKind::Revert, _) => JobState::Reverting,
        };
        let patch = JobPatch::new().with_step_progress(progress.clone());

        let applied = if to == job.state {
            self.store
                .update(&job.id, &patch.with_state(to), Some(job.state))
                .await?
        } else {
            self.transition(job, to, patch).await?
        };

        if applied && kind == ExecutionKind::Main && !progress.is_empty() {
            let mut updated = job.clone();
            updated.merge_step_progress(&progress);
            self.events
                .emit(Event::step_progress(job.id.clone(), updated.step_details))
                .await;
        }
        Ok(applied)
    }

    /// Apply the completion signal of an execution.
    ///
    /// Returns the state the job moved to, or `None` if it changed concurrently.
    pub async fn complete(
        &self,
        job: &Job,
        kind: ExecutionKind,
        completion: &Completion,
        trigger: RevertTrigger,
    ) -> Result<Option<JobState>, TransitionError> {
        let mut patch = JobPatch::new();
        let to = match kind {
            ExecutionKind::Main => {
                let failed = matches!(completion, Completion::Failure { .. });
                if let Completion::Failure { message } = completion {
                    patch = patch.with_failure(FailureInfo::workflow(
                        job.failed_step_name(),
                        message.clone(),
                    ));
                }
                if (failed && trigger.covers_failure())
                    || (job.is_cancelled() && trigger.covers_cancel())
                {
                    JobState::ReadyForRevert
                } else if job.is_cancelled() {
                    JobState::Cancelled
                } else if failed {
                    JobState::Failed
                } else {
                    JobState::Done
                }
            }
            ExecutionKind::Revert => {
                if let Completion::Failure { message } = completion {
                    patch = patch.with_failure(FailureInfo::workflow(
                        None,
                        format!("revert workflow failed: {}", message),
                    ));
                }
                if job.is_cancelled() {
                    JobState::Cancelled
                } else {
                    JobState::Failed
                }
            }
        };

        Ok(self.transition(job, to, patch).await?.then_some(to))
    }

    /// Request cancellation of a job.
    ///
    /// Jobs that have not started any external work are cancelled at once;
    /// executing jobs are flagged and steered to `Cancelled` at their next
    /// touch-point.
    pub async fn cancel(
        &self,
        job_id: &JobId,
        user_id: Option<UserId>,
    ) -> Result<CancelOutcome, TransitionError> {
        for _ in 0..MAX_CANCEL_ATTEMPTS {
            let job = self.store.get(job_id).await?;
            if job.state.is_terminal() || job.is_cancelled() {
                return Ok(CancelOutcome::Unchanged(job.state));
            }
            if !job.cancellation_info.cancellable {
                return Err(TransitionError::NotCancellable(job.id));
            }

            let info = CancellationInfo {
                is_cancelled: true,
                cancellable: true,
                user_id: user_id.clone(),
                cancel_time: Some(Utc::now()),
            };
            let patch = JobPatch::new().with_cancellation(info);

            if job.state.is_before_execution() {
                if self.transition(&job, JobState::Cancelled, patch).await? {
                    return Ok(CancelOutcome::Cancelled);
                }
            } else if self.store.update(&job.id, &patch, Some(job.state)).await? {
                tracing::info!(job_id = %job.id, state = %job.state, "cancellation requested");
                return Ok(CancelOutcome::Flagged(job.state));
            }
        }
        Err(TransitionError::Storage(StorageError::Other(format!(
            "job {} kept changing while being cancelled",
            job_id
        ))))
    }

    /// Reset a job whose execution disappeared from the workflow engine.
    ///
    /// A cancelled job whose main execution is gone has nothing left to
    /// steer and finishes as `Cancelled` instead of returning to admission.
    /// Returns the state the job moved to, or `None` if it changed concurrently.
    pub async fn reset_for_recovery(
        &self,
        job: &Job,
        kind: ExecutionKind,
    ) -> Result<Option<JobState>, TransitionError> {
        if kind == ExecutionKind::Main && job.is_cancelled() {
            if !MAIN_EXECUTION_STATES.contains(&job.state) {
                return Err(TransitionError::Illegal {
                    job_id: job.id.clone(),
                    from: job.state,
                    to: JobState::Cancelled,
                });
            }
            let to = JobState::Cancelled;
            return Ok(self.transition(job, to, JobPatch::new()).await?.then_some(to));
        }

        let execution = ExecutionPatch::default().clear_execution_id().reset_retry();
        let mut patch = JobPatch::new().with_execution(kind, execution);
        let to = match kind {
            ExecutionKind::Main => {
                patch = patch.with_gpu_reserved(false);
                JobState::Submitted
            }
            ExecutionKind::Revert => JobState::ReadyForRevert,
        };
        if !job.state.is_recovery_reset(to) {
            return Err(TransitionError::Illegal {
                job_id: job.id.clone(),
                from: job.state,
                to,
            });
        }
        Ok(self.transition(job, to, patch).await?.then_some(to))
    }
}
