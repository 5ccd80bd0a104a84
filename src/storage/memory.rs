//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and development.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

use super::{
    lock_states, scheduling_order, AggregateRow, Aggregation, FindOrder, JobFilter, JobPatch, JobStore,
    JobSubmitter, StorageError,
};
use crate::core::job::{ExecutionKind, Job};
use crate::core::state::JobState;
use crate::core::types::{JobId, OrganizationId};

/// In-memory storage backend.
///
/// A single lock guards the whole collection, so every operation
/// (including find-and-lock) is atomic with respect to the others.
/// Data is not persisted across restarts.
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored jobs.
    pub fn len(&self) -> usize {
        self.jobs.read().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_next(&self, kind: ExecutionKind) -> Result<Option<Job>, StorageError> {
        let (from, to) = lock_states(kind);
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        let next = jobs
            .values()
            .filter(|job| job.state == from)
            .min_by(|a, b| scheduling_order(a, b))
            .map(|job| job.id.clone());

        Ok(next.and_then(|id| {
            let job = jobs.get_mut(&id)?;
            job.state = to;
            job.executions.get_mut(kind).locked_at = Some(Utc::now());
            Some(job.clone())
        }))
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

fn sort_by_creation(jobs: &mut [Job], order: FindOrder) {
    match order {
        FindOrder::None => {}
        FindOrder::Latest => jobs.sort_by(|a, b| b.creation_time.cmp(&a.creation_time)),
        FindOrder::Earliest => jobs.sort_by(|a, b| a.creation_time.cmp(&b.creation_time)),
    }
}

fn admission_candidates<'a>(
    jobs: impl Iterator<Item = &'a Job> + Clone,
    job_types: &[String],
    organization_id: Option<&OrganizationId>,
    limit: usize,
) -> Vec<JobId> {
    let held_keys: HashSet<&str> = jobs
        .clone()
        .filter(|job| job.state.is_in_flight() && !job.is_cancelled())
        .map(|job| job.key.as_str())
        .collect();

    let mut submitted: Vec<&Job> = jobs
        .filter(|job| job.state == JobState::Submitted && !job.is_cancelled())
        .filter(|job| job_types.contains(&job.job_type))
        .filter(|job| organization_id.map_or(true, |org| &job.organization_id == org))
        .collect();
    submitted.sort_by(|a, b| scheduling_order(a, b));

    let mut seen_keys = HashSet::new();
    submitted
        .into_iter()
        .filter(|job| !held_keys.contains(job.key.as_str()))
        .filter(|job| seen_keys.insert(job.key.as_str()))
        .take(limit)
        .map(|job| job.id.clone())
        .collect()
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn get(&self, id: &JobId) -> Result<Job, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        jobs.get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))
    }

    async fn find_one(
        &self,
        filter: &JobFilter,
        order: FindOrder,
    ) -> Result<Option<Job>, StorageError> {
        Ok(self.find(filter, order, Some(1)).await?.into_iter().next())
    }

    async fn find(
        &self,
        filter: &JobFilter,
        order: FindOrder,
        limit: Option<usize>,
    ) -> Result<Vec<Job>, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<Job> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        sort_by_creation(&mut result, order);
        if let Some(limit) = limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn find_and_lock_for_scheduling(&self) -> Result<Option<Job>, StorageError> {
        self.lock_next(ExecutionKind::Main)
    }

    async fn find_and_lock_for_reverting(&self) -> Result<Option<Job>, StorageError> {
        self.lock_next(ExecutionKind::Revert)
    }

    async fn update(
        &self,
        id: &JobId,
        patch: &JobPatch,
        expected_state: Option<JobState>,
    ) -> Result<bool, StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))?;
        if expected_state.is_some_and(|expected| expected != job.state) {
            return Ok(false);
        }
        patch.apply(job);
        Ok(true)
    }

    async fn update_many(
        &self,
        filter: &JobFilter,
        patch: &JobPatch,
    ) -> Result<Vec<JobId>, StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        let mut updated = Vec::new();
        for job in jobs.values_mut().filter(|j| filter.matches(j)) {
            patch.apply(job);
            updated.push(job.id.clone());
        }
        updated.sort();
        Ok(updated)
    }

    async fn aggregate(&self, aggregation: &Aggregation) -> Result<Vec<AggregateRow>, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        let submitted = || {
            jobs.values()
                .filter(|j| j.state == JobState::Submitted && !j.is_cancelled())
        };

        let rows = match aggregation {
            Aggregation::SubmittedJobTypes => submitted()
                .map(|j| j.job_type.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .map(AggregateRow::JobType)
                .collect(),
            Aggregation::SubmittedOrganizations { job_types } => submitted()
                .filter(|j| job_types.contains(&j.job_type))
                .map(|j| j.organization_id.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .map(AggregateRow::Organization)
                .collect(),
            Aggregation::Count(filter) => {
                vec![AggregateRow::Count(
                    jobs.values().filter(|j| filter.matches(j)).count() as u64,
                )]
            }
            Aggregation::AdmissionCandidates {
                job_types,
                organization_id,
                limit,
            } => admission_candidates(jobs.values(), job_types, organization_id.as_ref(), *limit)
                .into_iter()
                .map(AggregateRow::Candidate)
                .collect(),
            Aggregation::ActiveTenants => jobs
                .values()
                .filter(|j| !j.state.is_terminal())
                .map(|j| j.tenant())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .map(AggregateRow::Tenant)
                .collect(),
        };
        Ok(rows)
    }

    async fn delete_many(&self, filter: &JobFilter) -> Result<u64, StorageError> {
        if filter.is_empty() {
            return Err(StorageError::UnfilteredDelete);
        }
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        let before = jobs.len();
        jobs.retain(|_, job| !filter.matches(job));
        Ok((before - jobs.len()) as u64)
    }
}

#[async_trait]
impl JobSubmitter for InMemoryJobStore {
    async fn submit(&self, job: Job) -> Result<(), StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(StorageError::DuplicateKey(format!("job: {}", job.id)));
        }
        jobs.insert(job.id.clone(), job);
        Ok(())
    }
}
