//! Recovery of jobs whose external execution disappeared.
//!
//! The recovery loop walks every tenant with unfinished jobs, asks the
//! workflow engine in bounded batches whether the executions of started
//! jobs still exist, and resets the jobs whose execution is gone: main
//! executions back to `Submitted` for re-admission, revert executions
//! back to `ReadyForRevert`. It never fails a job on its own; a cancelled
//! job whose main execution is gone finishes as `Cancelled`.
//!
//! Each pass also returns stale scheduling locks to their ready state. A
//! lock is stale once it is older than the configured lock timeout, which
//! happens when an instance dies or loses its store between locking a job
//! and recording the started execution. Jobs whose type has no workflow
//! for the locked kind stay locked for operator intervention.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SchedulerConfig;
use crate::core::job::{ExecutionKind, Job};
use crate::core::state::{MAIN_EXECUTION_STATES, REVERT_EXECUTION_STATES};
use crate::core::types::{ExecutionId, JobId, Tenant};
use crate::lifecycle::StateMachine;
use crate::storage::{
    lock_states, AggregateRow, Aggregation, FindOrder, JobFilter, JobStore, StorageError,
};
use crate::workflow::WorkflowEngine;

/// Outcome of one recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Tenants visited.
    pub tenants: usize,
    /// Started jobs whose execution was looked up.
    pub checked: usize,
    /// Jobs reset because their execution was missing.
    pub reset: Vec<JobId>,
    /// Jobs whose stale scheduling lock was released.
    pub released: Vec<JobId>,
    /// Batches skipped because the engine or the store failed.
    pub failed_batches: usize,
}

/// Periodic reconciliation of started jobs against the workflow engine.
pub struct RecoveryLoop<S: JobStore> {
    store: Arc<S>,
    state_machine: Arc<StateMachine<S>>,
    engine: Arc<dyn WorkflowEngine>,
    batch_size: usize,
    lock_timeout: Duration,
    /// Job types with a workflow configured, per execution kind.
    startable: HashSet<(String, ExecutionKind)>,
}

impl<S: JobStore> RecoveryLoop<S> {
    pub fn new(
        state_machine: Arc<StateMachine<S>>,
        engine: Arc<dyn WorkflowEngine>,
        config: &SchedulerConfig,
    ) -> Self {
        let mut startable = HashSet::new();
        for job_type in &config.job_types {
            startable.insert((job_type.job_type.clone(), ExecutionKind::Main));
            if job_type.revert.is_some() {
                startable.insert((job_type.job_type.clone(), ExecutionKind::Revert));
            }
        }
        Self {
            store: state_machine.store().clone(),
            state_machine,
            engine,
            batch_size: config.recovery_batch_size.max(1),
            lock_timeout: config.lock_timeout(),
            startable,
        }
    }

    /// Run one recovery pass over every active tenant.
    pub async fn run_once(&self) -> Result<RecoveryReport, StorageError> {
        let rows = self.store.aggregate(&Aggregation::ActiveTenants).await?;
        let tenants: Vec<Tenant> = rows
            .into_iter()
            .filter_map(|row| match row {
                AggregateRow::Tenant(t) => Some(t),
                _ => None,
            })
            .collect();

        let mut report = RecoveryReport {
            tenants: tenants.len(),
            ..Default::default()
        };
        for tenant in &tenants {
            for kind in [ExecutionKind::Main, ExecutionKind::Revert] {
                self.recover_tenant(tenant, kind, &mut report).await;
            }
        }
        for kind in [ExecutionKind::Main, ExecutionKind::Revert] {
            self.release_stale_locks(kind, &mut report).await;
        }

        if !report.reset.is_empty() || !report.released.is_empty() {
            tracing::info!(
                tenants = report.tenants,
                checked = report.checked,
                reset = report.reset.len(),
                released = report.released.len(),
                "recovery pass reset jobs"
            );
        }
        Ok(report)
    }

    /// Whether the job's `kind` lock is older than the lock timeout.
    ///
    /// Locks written before lock times were recorded count as stale.
    fn is_stale(&self, job: &Job, kind: ExecutionKind) -> bool {
        match job.execution(kind).locked_at {
            Some(locked_at) => (Utc::now() - locked_at)
                .to_std()
                .is_ok_and(|age| age >= self.lock_timeout),
            None => true,
        }
    }

    async fn release_stale_locks(&self, kind: ExecutionKind, report: &mut RecoveryReport) {
        let (_, locked) = lock_states(kind);
        let filter = JobFilter::new().with_state(locked);
        let jobs = match self.store.find(&filter, FindOrder::Earliest, None).await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(kind = %kind, error = %e, "failed to list locked jobs");
                report.failed_batches += 1;
                return;
            }
        };

        for job in jobs.iter().filter(|job| self.is_stale(job, kind)) {
            if !self.startable.contains(&(job.job_type.clone(), kind)) {
                tracing::debug!(job_id = %job.id, kind = %kind, "unmapped job type stays locked");
                continue;
            }
            match self.state_machine.release_lock(job, kind, "scheduling lock expired").await {
                Ok(true) => {
                    tracing::warn!(
                        job_id = %job.id,
                        kind = %kind,
                        locked_at = ?job.execution(kind).locked_at,
                        "stale lock released"
                    );
                    report.released.push(job.id.clone());
                }
                Ok(false) => {
                    tracing::debug!(job_id = %job.id, "job changed during recovery, skipping");
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "failed to release stale lock");
                }
            }
        }
    }

    async fn recover_tenant(&self, tenant: &Tenant, kind: ExecutionKind, report: &mut RecoveryReport) {
        let states = match kind {
            ExecutionKind::Main => MAIN_EXECUTION_STATES,
            ExecutionKind::Revert => REVERT_EXECUTION_STATES,
        };
        let filter = JobFilter::new().with_tenant(tenant).with_states(states);
        let jobs = match self.store.find(&filter, FindOrder::Earliest, None).await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(tenant = %tenant, kind = %kind, error = %e, "failed to list started jobs");
                report.failed_batches += 1;
                return;
            }
        };

        for batch in jobs.chunks(self.batch_size) {
            report.checked += batch.len();
            match self.live_executions(batch, kind).await {
                Some(live) => {
                    for job in batch {
                        let alive = job
                            .execution(kind)
                            .execution_id
                            .as_ref()
                            .is_some_and(|id| live.contains(id));
                        if !alive {
                            self.reset(job, kind, report).await;
                        }
                    }
                }
                None => report.failed_batches += 1,
            }
        }
    }

    /// Execution ids of the batch that the engine still knows.
    async fn live_executions(&self, batch: &[Job], kind: ExecutionKind) -> Option<HashSet<ExecutionId>> {
        let ids: Vec<ExecutionId> = batch
            .iter()
            .filter_map(|job| job.execution(kind).execution_id.clone())
            .collect();
        if ids.is_empty() {
            return Some(HashSet::new());
        }
        match self.engine.list_executions(&ids).await {
            Ok(handles) => Some(handles.into_iter().map(|h| h.execution_id).collect()),
            Err(e) => {
                tracing::warn!(kind = %kind, batch = ids.len(), error = %e, "failed to list executions, skipping batch");
                None
            }
        }
    }

    async fn reset(&self, job: &Job, kind: ExecutionKind, report: &mut RecoveryReport) {
        match self.state_machine.reset_for_recovery(job, kind).await {
            Ok(Some(to)) => {
                tracing::warn!(
                    job_id = %job.id,
                    kind = %kind,
                    from = %job.state,
                    to = %to,
                    execution_id = ?job.execution(kind).execution_id,
                    "execution missing, job reset"
                );
                report.reset.push(job.id.clone());
            }
            Ok(None) => {
                tracing::debug!(job_id = %job.id, "job changed during recovery, skipping");
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "failed to reset job");
            }
        }
    }
}
