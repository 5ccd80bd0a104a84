//! Admission of submitted jobs.
//!
//! An admission run resolves the policy of every job type with submitted
//! work, splits the types into admission groups and promotes as many
//! candidates per group as the group's remaining headroom allows:
//!
//! - `MaxRunning(n)`: one group per type, headroom `n - admitted jobs of the type`
//! - `Gpu`: one group for all GPU types, headroom `capacity - reserved jobs`
//! - `Quota`: one group per organization, headroom `quota - admitted jobs of the org`
//!
//! Candidates come from [`Aggregation::AdmissionCandidates`], which already
//! excludes cancelled jobs and keys held by in-flight jobs.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{CapacitySignals, Policy, PolicyResolver};
use crate::core::state::{JobState, ADMITTED_STATES, NON_TERMINAL_STATES};
use crate::core::types::{JobId, OrganizationId};
use crate::lifecycle::StateMachine;
use crate::storage::{count_of, AggregateRow, Aggregation, JobFilter, JobStore, StorageError};

/// Outcome of one admission run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdmissionReport {
    /// Jobs promoted to `ReadyForScheduling`.
    pub promoted: Vec<JobId>,
    /// Admission groups evaluated.
    pub groups: usize,
    /// Groups skipped because of an error or an unknown capacity signal.
    pub skipped: usize,
}

/// One set of job types sharing a limit.
#[derive(Debug)]
struct AdmissionGroup {
    label: String,
    job_types: Vec<String>,
    organization_id: Option<OrganizationId>,
    reserve_gpu: bool,
}

/// Promotes submitted jobs according to their type's admission policy.
pub struct AdmissionEngine<S: JobStore> {
    store: Arc<S>,
    state_machine: Arc<StateMachine<S>>,
    resolver: PolicyResolver,
    capacity: Arc<dyn CapacitySignals>,
}

impl<S: JobStore> AdmissionEngine<S> {
    pub fn new(
        state_machine: Arc<StateMachine<S>>,
        resolver: PolicyResolver,
        capacity: Arc<dyn CapacitySignals>,
    ) -> Self {
        Self {
            store: state_machine.store().clone(),
            state_machine,
            resolver,
            capacity,
        }
    }

    pub fn resolver(&self) -> &PolicyResolver {
        &self.resolver
    }

    /// Run one admission pass over every job type with submitted jobs.
    ///
    /// Only failing to list the submitted job types aborts the run; errors
    /// within a group are logged and the remaining groups still run.
    pub async fn run_once(&self) -> Result<AdmissionReport, StorageError> {
        let rows = self.store.aggregate(&Aggregation::SubmittedJobTypes).await?;
        let job_types: Vec<String> = rows
            .into_iter()
            .filter_map(|row| match row {
                AggregateRow::JobType(t) => Some(t),
                _ => None,
            })
            .collect();

        let mut report = AdmissionReport::default();
        if job_types.is_empty() {
            return Ok(report);
        }

        let policies = self.resolver.resolve_all(job_types.iter().map(String::as_str));
        let mut groups = Vec::new();
        let mut gpu_types = Vec::new();
        let mut quota_types = Vec::new();
        for (job_type, policy) in &policies {
            match policy {
                Policy::MaxRunning(_) => groups.push((
                    *policy,
                    AdmissionGroup {
                        label: job_type.clone(),
                        job_types: vec![job_type.clone()],
                        organization_id: None,
                        reserve_gpu: false,
                    },
                )),
                Policy::Gpu => gpu_types.push(job_type.clone()),
                Policy::Quota => quota_types.push(job_type.clone()),
            }
        }

        if !gpu_types.is_empty() {
            groups.push((
                Policy::Gpu,
                AdmissionGroup {
                    label: "gpu".to_string(),
                    job_types: gpu_types,
                    organization_id: None,
                    reserve_gpu: true,
                },
            ));
        }

        if !quota_types.is_empty() {
            match self.quota_groups(quota_types).await {
                Ok(quota_groups) => {
                    groups.extend(quota_groups.into_iter().map(|g| (Policy::Quota, g)))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to list organizations for quota admission");
                    report.skipped += 1;
                }
            }
        }

        for (policy, group) in groups {
            report.groups += 1;
            match self.admit_group(policy, &group).await {
                Ok(Some(mut promoted)) => report.promoted.append(&mut promoted),
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    tracing::warn!(group = %group.label, policy = %policy, error = %e, "admission failed for group");
                    report.skipped += 1;
                }
            }
        }

        if !report.promoted.is_empty() {
            tracing::info!(promoted = report.promoted.len(), groups = report.groups, "admission run finished");
        }
        Ok(report)
    }

    /// Current policy of every job type with submitted jobs.
    pub async fn current_policies(&self) -> Result<BTreeMap<String, Policy>, StorageError> {
        let rows = self.store.aggregate(&Aggregation::SubmittedJobTypes).await?;
        let types: Vec<String> = rows
            .into_iter()
            .filter_map(|row| match row {
                AggregateRow::JobType(t) => Some(t),
                _ => None,
            })
            .collect();
        Ok(self.resolver.resolve_all(types.iter().map(String::as_str)))
    }

    async fn quota_groups(
        &self,
        job_types: Vec<String>,
    ) -> Result<Vec<AdmissionGroup>, StorageError> {
        let rows = self
            .store
            .aggregate(&Aggregation::SubmittedOrganizations {
                job_types: job_types.clone(),
            })
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match row {
                AggregateRow::Organization(org) => Some(org),
                _ => None,
            })
            .map(|org| AdmissionGroup {
                label: format!("quota:{}", org),
                job_types: job_types.clone(),
                organization_id: Some(org),
                reserve_gpu: false,
            })
            .collect())
    }

    /// Promote the group's candidates; `None` when the limit is unknown.
    async fn admit_group(
        &self,
        policy: Policy,
        group: &AdmissionGroup,
    ) -> Result<Option<Vec<JobId>>, StorageError> {
        let (limit, in_use) = match policy {
            Policy::MaxRunning(limit) => {
                let filter = JobFilter::new()
                    .with_job_types(group.job_types.iter().cloned())
                    .with_states(ADMITTED_STATES);
                (limit, self.count(filter).await?)
            }
            Policy::Gpu => {
                let Some(capacity) = self.capacity.gpu_capacity().await else {
                    tracing::debug!(group = %group.label, "gpu capacity unknown, skipping admission");
                    return Ok(None);
                };
                let filter = JobFilter::new()
                    .gpu_reserved(true)
                    .with_states(NON_TERMINAL_STATES);
                (capacity, self.count(filter).await?)
            }
            Policy::Quota => {
                let Some(org) = &group.organization_id else {
                    return Ok(None);
                };
                let quota = self.capacity.org_quota(org).await;
                let filter = JobFilter::new()
                    .with_job_types(group.job_types.iter().cloned())
                    .with_organization(org.clone())
                    .with_states(ADMITTED_STATES);
                (quota, self.count(filter).await?)
            }
        };

        let remaining = u64::from(limit).saturating_sub(in_use) as usize;
        if remaining == 0 {
            tracing::debug!(group = %group.label, limit, in_use, "admission group is full");
            return Ok(Some(Vec::new()));
        }

        let rows = self
            .store
            .aggregate(&Aggregation::AdmissionCandidates {
                job_types: group.job_types.clone(),
                organization_id: group.organization_id.clone(),
                limit: remaining,
            })
            .await?;
        let candidates: Vec<JobId> = rows
            .into_iter()
            .filter_map(|row| match row {
                AggregateRow::Candidate(id) => Some(id),
                _ => None,
            })
            .collect();
        if candidates.is_empty() {
            return Ok(Some(Vec::new()));
        }

        let promoted = self
            .state_machine
            .promote(&candidates, group.reserve_gpu)
            .await
            .map_err(|e| match e {
                crate::lifecycle::TransitionError::Storage(e) => e,
                other => StorageError::Other(other.to_string()),
            })?;
        tracing::debug!(
            group = %group.label,
            candidates = candidates.len(),
            promoted = promoted.len(),
            state = %JobState::ReadyForScheduling,
            "promoted submitted jobs"
        );
        Ok(Some(promoted))
    }

    async fn count(&self, filter: JobFilter) -> Result<u64, StorageError> {
        let rows = self.store.aggregate(&Aggregation::Count(filter)).await?;
        Ok(count_of(&rows))
    }
}
