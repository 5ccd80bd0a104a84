//! Starting external executions for locked jobs.
//!
//! The `ExecutionDriver` handles one locked job at a time:
//! - Finishing jobs whose start retries are exhausted
//! - Reusing an execution left behind by an earlier attempt
//! - Returning the lock when the engine or the store fails, so a later cycle retries

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use super::naming::execution_name;
use crate::config::{JobTypeConfig, SchedulerConfig, WorkflowRef};
use crate::core::job::{ExecutionKind, Job, StepDetail};
use crate::core::retry::StartRetryPolicy;
use crate::core::state::JobState;
use crate::core::types::{ExecutionId, JobId};
use crate::lifecycle::{StateMachine, TransitionError};
use crate::storage::JobStore;
use crate::workflow::{StartRequest, TenantContext, WorkflowEngine, WorkflowError};

/// Upper bound of jobs handled by a single `run_once` call.
const MAX_JOBS_PER_RUN: usize = 256;

/// Errors raised while driving a job.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The job type has no workflow of this kind configured.
    #[error("no {kind} workflow configured for job type '{job_type}'")]
    MissingWorkflow {
        job_type: String,
        kind: ExecutionKind,
    },

    /// The engine does not know the configured workflow.
    #[error("workflow {name}:{version} not found in the workflow engine")]
    WorkflowNotFound { name: String, version: String },

    #[error(transparent)]
    Engine(#[from] WorkflowError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl DriverError {
    /// Whether retrying the job cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DriverError::MissingWorkflow { .. })
    }
}

/// What happened to a locked job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// No job was ready.
    Idle,
    /// The execution was started, or an existing one reused.
    Scheduled {
        job_id: JobId,
        execution_id: ExecutionId,
        reused: bool,
    },
    /// The start failed and the job was returned to its ready state.
    Retrying { job_id: JobId, attempts: u32 },
    /// The start retries were exhausted and the job finished.
    Exhausted { job_id: JobId, state: JobState },
    /// The job was cancelled before its execution started.
    Cancelled { job_id: JobId },
    /// The job changed concurrently and the result was not recorded.
    LostRace { job_id: JobId },
}

/// Starts external executions for locked jobs.
pub struct ExecutionDriver<S: JobStore> {
    state_machine: Arc<StateMachine<S>>,
    engine: Arc<dyn WorkflowEngine>,
    job_types: HashMap<String, JobTypeConfig>,
    retry_policy: StartRetryPolicy,
}

impl<S: JobStore> ExecutionDriver<S> {
    pub fn new(
        state_machine: Arc<StateMachine<S>>,
        engine: Arc<dyn WorkflowEngine>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            state_machine,
            engine,
            job_types: config
                .job_types
                .iter()
                .map(|t| (t.job_type.clone(), t.clone()))
                .collect(),
            retry_policy: config.retry_policy(),
        }
    }

    pub fn retry_policy(&self) -> StartRetryPolicy {
        self.retry_policy
    }

    /// Lock the next ready job and start its main execution.
    pub async fn schedule_next(&self) -> Result<ScheduleOutcome, DriverError> {
        match self.state_machine.lock_for_scheduling().await? {
            Some(job) => self.drive(&job, ExecutionKind::Main).await,
            None => Ok(ScheduleOutcome::Idle),
        }
    }

    /// Lock the next job ready for revert and start its revert execution.
    pub async fn revert_next(&self) -> Result<ScheduleOutcome, DriverError> {
        match self.state_machine.lock_for_reverting().await? {
            Some(job) => self.drive(&job, ExecutionKind::Revert).await,
            None => Ok(ScheduleOutcome::Idle),
        }
    }

    /// Drain ready jobs of one kind.
    ///
    /// Stops at the first retried start so a failing engine is not hit in a
    /// tight loop. Jobs with a configuration error stay locked and are
    /// skipped; any other error ends the run.
    pub async fn run_once(&self, kind: ExecutionKind) -> Result<Vec<ScheduleOutcome>, DriverError> {
        let mut outcomes = Vec::new();
        for _ in 0..MAX_JOBS_PER_RUN {
            let result = match kind {
                ExecutionKind::Main => self.schedule_next().await,
                ExecutionKind::Revert => self.revert_next().await,
            };
            match result {
                Ok(ScheduleOutcome::Idle) => break,
                Ok(outcome @ ScheduleOutcome::Retrying { .. }) => {
                    outcomes.push(outcome);
                    break;
                }
                Ok(outcome) => outcomes.push(outcome),
                Err(e) if e.is_fatal() => {
                    tracing::error!(kind = %kind, error = %e, "job left locked for operator intervention");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcomes)
    }

    /// Start (or reuse) the `kind` execution of a job locked by this instance.
    pub async fn drive(&self, job: &Job, kind: ExecutionKind) -> Result<ScheduleOutcome, DriverError> {
        let attempts = job.execution(kind).start_retry_counter;
        if self.retry_policy.is_exhausted(attempts) {
            tracing::warn!(job_id = %job.id, kind = %kind, attempts, "start retries exhausted");
            return Ok(match self.state_machine.finish_exhausted(job, kind).await? {
                Some(state) => ScheduleOutcome::Exhausted {
                    job_id: job.id.clone(),
                    state,
                },
                None => ScheduleOutcome::LostRace {
                    job_id: job.id.clone(),
                },
            });
        }

        if kind == ExecutionKind::Main && job.is_cancelled() {
            let applied = self.state_machine.finish_cancelled(job).await?;
            return Ok(if applied {
                ScheduleOutcome::Cancelled {
                    job_id: job.id.clone(),
                }
            } else {
                ScheduleOutcome::LostRace {
                    job_id: job.id.clone(),
                }
            });
        }

        let (workflow, steps) = self.workflow_for(job, kind)?;

        match self.start(job, kind, &workflow).await {
            Ok((execution_id, launch_plan_id, reused)) => {
                let recorded = self
                    .state_machine
                    .mark_scheduled(job, kind, execution_id.clone(), &launch_plan_id, steps, reused)
                    .await;
                let applied = match recorded {
                    Ok(applied) => applied,
                    // The execution name is deterministic, so the retry reuses it.
                    Err(e) => {
                        return self
                            .release_after_record_failure(job, kind, &execution_id, e)
                            .await;
                    }
                };
                if !applied {
                    return Ok(ScheduleOutcome::LostRace {
                        job_id: job.id.clone(),
                    });
                }
                tracing::info!(
                    job_id = %job.id,
                    kind = %kind,
                    execution_id = %execution_id,
                    reused,
                    "job scheduled"
                );
                Ok(ScheduleOutcome::Scheduled {
                    job_id: job.id.clone(),
                    execution_id,
                    reused,
                })
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %job.id,
                    kind = %kind,
                    attempt = attempts + 1,
                    remaining = self.retry_policy.remaining(attempts + 1),
                    error = %e,
                    "failed to start execution, releasing lock"
                );
                if !self.state_machine.release_lock(job, kind, &e.to_string()).await? {
                    return Ok(ScheduleOutcome::LostRace {
                        job_id: job.id.clone(),
                    });
                }
                Ok(ScheduleOutcome::Retrying {
                    job_id: job.id.clone(),
                    attempts: attempts + 1,
                })
            }
        }
    }

    async fn release_after_record_failure(
        &self,
        job: &Job,
        kind: ExecutionKind,
        execution_id: &ExecutionId,
        error: TransitionError,
    ) -> Result<ScheduleOutcome, DriverError> {
        let attempts = job.execution(kind).start_retry_counter;
        tracing::warn!(
            job_id = %job.id,
            kind = %kind,
            execution_id = %execution_id,
            error = %error,
            "failed to record started execution, releasing lock"
        );
        let message = format!("failed to record execution {}: {}", execution_id, error);
        match self.state_machine.release_lock(job, kind, &message).await {
            Ok(true) => Ok(ScheduleOutcome::Retrying {
                job_id: job.id.clone(),
                attempts: attempts + 1,
            }),
            Ok(false) => Ok(ScheduleOutcome::LostRace {
                job_id: job.id.clone(),
            }),
            Err(release) => {
                tracing::warn!(
                    job_id = %job.id,
                    kind = %kind,
                    error = %release,
                    "failed to release lock, recovery releases it once it is stale"
                );
                Err(error.into())
            }
        }
    }

    fn workflow_for(
        &self,
        job: &Job,
        kind: ExecutionKind,
    ) -> Result<(WorkflowRef, Vec<StepDetail>), DriverError> {
        let missing = || DriverError::MissingWorkflow {
            job_type: job.job_type.clone(),
            kind,
        };
        let config = self.job_types.get(&job.job_type).ok_or_else(missing)?;
        match kind {
            ExecutionKind::Main => Ok((config.workflow.clone(), config.initial_steps())),
            ExecutionKind::Revert => {
                let revert = config.revert.as_ref().ok_or_else(missing)?;
                Ok((revert.workflow.clone(), Vec::new()))
            }
        }
    }

    /// Find or create the execution; returns its id, launch plan and whether it was reused.
    async fn start(
        &self,
        job: &Job,
        kind: ExecutionKind,
        workflow: &WorkflowRef,
    ) -> Result<(ExecutionId, String, bool), DriverError> {
        let definition = self
            .engine
            .fetch_workflow(&workflow.name, &workflow.version)
            .await?
            .ok_or_else(|| DriverError::WorkflowNotFound {
                name: workflow.name.clone(),
                version: workflow.version.clone(),
            })?;

        let name = execution_name(&job.id, kind);
        if let Some(existing) = self.engine.fetch_execution(&name).await? {
            tracing::debug!(job_id = %job.id, execution_id = %name, phase = %existing.phase, "reusing execution");
            return Ok((existing.execution_id, definition.launch_plan_id, true));
        }

        let launch_plan_id = definition.launch_plan_id.clone();
        let handle = self
            .engine
            .start_execution(StartRequest {
                workflow: definition,
                execution_id: name,
                payload: job.payload.clone(),
                tenant: TenantContext::for_job(job),
            })
            .await?;
        Ok((handle.execution_id, launch_plan_id, false))
    }
}
