//! SQLite storage implementation.
//!
//! Provides persistent storage using SQLite database. Each row carries the
//! serialized job document plus the columns used for filtering; writes go
//! through an optimistic `version` check so concurrent scheduler instances
//! never lose updates.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;

use super::{
    lock_states, AggregateRow, Aggregation, FindOrder, JobFilter, JobPatch, JobStore, JobSubmitter,
    StorageError,
};
use crate::core::job::{ExecutionKind, Job};
use crate::core::state::{JobState, IN_FLIGHT_STATES};
use crate::core::types::{JobId, OrganizationId, Tenant, WorkspaceId};

/// Attempts of an optimistic read-modify-write before giving up.
const MAX_WRITE_ATTEMPTS: usize = 16;

/// SQLite storage backend.
///
/// Provides persistent storage with automatic schema migration.
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Create a new SQLite store with the given database path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| StorageError::Other(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(map_sqlx_error)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(map_sqlx_error)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn load(&self, id: &JobId) -> Result<Option<(Job, i64)>, StorageError> {
        let row = sqlx::query("SELECT doc, version FROM jobs WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.map(|row| {
            let version: i64 = row.try_get("version").map_err(map_sqlx_error)?;
            Ok((decode_row(&row)?, version))
        })
        .transpose()
    }

    /// Write back a modified document if nobody changed it since `version`.
    async fn store_if_unchanged(&self, job: &Job, version: i64) -> Result<bool, StorageError> {
        let doc = encode(job)?;
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = ?, is_cancelled = ?, gpu_reserved = ?,
                main_execution_id = ?, revert_execution_id = ?,
                doc = ?, version = version + 1
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(job.state.as_str())
        .bind(job.is_cancelled())
        .bind(job.gpu_reserved)
        .bind(job.executions.main.execution_id.as_ref().map(|e| e.as_str()))
        .bind(job.executions.revert.execution_id.as_ref().map(|e| e.as_str()))
        .bind(doc)
        .bind(job.id.as_str())
        .bind(version)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() == 1)
    }

    /// Apply `patch` to a job as long as `guard` holds on its current document.
    async fn patch_where(
        &self,
        id: &JobId,
        patch: &JobPatch,
        guard: impl Fn(&Job) -> bool,
    ) -> Result<Option<bool>, StorageError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let Some((mut job, version)) = self.load(id).await? else {
                return Ok(None);
            };
            if !guard(&job) {
                return Ok(Some(false));
            }
            patch.apply(&mut job);
            if self.store_if_unchanged(&job, version).await? {
                return Ok(Some(true));
            }
        }
        Err(StorageError::Other(format!(
            "job {} kept changing during update",
            id
        )))
    }

    async fn lock_next(&self, kind: ExecutionKind) -> Result<Option<Job>, StorageError> {
        let (from, to) = lock_states(kind);
        let locked_at_path = format!("$.executions.{}.locked_at", kind.as_str());
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET state = ?1,
                doc = json_set(doc, '$.state', ?1, ?3, ?4),
                version = version + 1
            WHERE id = (
                SELECT id FROM jobs
                WHERE state = ?2
                ORDER BY priority DESC, creation_time ASC, id ASC
                LIMIT 1
            )
            AND state = ?2
            RETURNING doc
            "#,
        )
        .bind(to.as_str())
        .bind(from.as_str())
        .bind(locked_at_path)
        .bind(Utc::now().to_rfc3339())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(|row| decode_row(&row)).transpose()
    }

    async fn fetch_docs(&self, mut query: QueryBuilder<'_, Sqlite>) -> Result<Vec<Job>, StorageError> {
        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(decode_row).collect()
    }

    async fn fetch_strings(
        &self,
        mut query: QueryBuilder<'_, Sqlite>,
    ) -> Result<Vec<String>, StorageError> {
        let rows: Vec<(String,)> = query
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().map(|(s,)| s).collect())
    }
}

fn map_sqlx_error(e: sqlx::Error) -> StorageError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StorageError::Unavailable(e.to_string())
        }
        other => StorageError::Other(other.to_string()),
    }
}

fn encode(job: &Job) -> Result<String, StorageError> {
    serde_json::to_string(job).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn decode_row(row: &SqliteRow) -> Result<Job, StorageError> {
    let doc: String = row.try_get("doc").map_err(map_sqlx_error)?;
    serde_json::from_str(&doc).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn push_in<'a>(
    query: &mut QueryBuilder<'a, Sqlite>,
    column: &str,
    values: impl IntoIterator<Item = String>,
) {
    let values: Vec<String> = values.into_iter().collect();
    if values.is_empty() {
        query.push(" AND 0");
        return;
    }
    query.push(" AND ").push(column).push(" IN (");
    let mut separated = query.separated(", ");
    for value in values {
        separated.push_bind(value);
    }
    separated.push_unseparated(")");
}

fn push_filter(query: &mut QueryBuilder<'_, Sqlite>, filter: &JobFilter) {
    query.push(" WHERE 1 = 1");
    if let Some(ids) = &filter.ids {
        push_in(query, "id", ids.iter().map(|id| id.to_string()));
    }
    if let Some(states) = &filter.states {
        push_in(query, "state", states.iter().map(|s| s.as_str().to_string()));
    }
    if let Some(types) = &filter.job_types {
        push_in(query, "job_type", types.iter().cloned());
    }
    if let Some(keys) = &filter.keys {
        push_in(query, "job_key", keys.iter().cloned());
    }
    if let Some(org) = &filter.organization_id {
        query.push(" AND organization_id = ").push_bind(org.to_string());
    }
    if let Some(ws) = &filter.workspace_id {
        query.push(" AND workspace_id = ").push_bind(ws.to_string());
    }
    if let Some(cancelled) = filter.is_cancelled {
        query.push(" AND is_cancelled = ").push_bind(cancelled);
    }
    if let Some(reserved) = filter.gpu_reserved {
        query.push(" AND gpu_reserved = ").push_bind(reserved);
    }
    if let Some(execution_id) = &filter.main_execution_id {
        query
            .push(" AND main_execution_id = ")
            .push_bind(execution_id.to_string());
    }
    if let Some(execution_id) = &filter.revert_execution_id {
        query
            .push(" AND revert_execution_id = ")
            .push_bind(execution_id.to_string());
    }
}

fn push_order(query: &mut QueryBuilder<'_, Sqlite>, order: FindOrder) {
    match order {
        FindOrder::None => {}
        FindOrder::Latest => {
            query.push(" ORDER BY creation_time DESC");
        }
        FindOrder::Earliest => {
            query.push(" ORDER BY creation_time ASC");
        }
    }
}

const SUBMITTED_CLAUSE: &str = " WHERE state = 'submitted' AND is_cancelled = 0";

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn get(&self, id: &JobId) -> Result<Job, StorageError> {
        self.load(id)
            .await?
            .map(|(job, _)| job)
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
        let mut query = QueryBuilder::new("SELECT doc FROM jobs");
        push_filter(&mut query, filter);
        push_order(&mut query, order);
        if let Some(limit) = limit {
            query.push(" LIMIT ").push_bind(limit as i64);
        }
        self.fetch_docs(query).await
    }

    async fn find_and_lock_for_scheduling(&self) -> Result<Option<Job>, StorageError> {
        self.lock_next(ExecutionKind::Main).await
    }

    async fn find_and_lock_for_reverting(&self) -> Result<Option<Job>, StorageError> {
        self.lock_next(ExecutionKind::Revert).await
    }

    async fn update(
        &self,
        id: &JobId,
        patch: &JobPatch,
        expected_state: Option<JobState>,
    ) -> Result<bool, StorageError> {
        self.patch_where(id, patch, |job| {
            expected_state.map_or(true, |expected| job.state == expected)
        })
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))
    }

    async fn update_many(
        &self,
        filter: &JobFilter,
        patch: &JobPatch,
    ) -> Result<Vec<JobId>, StorageError> {
        let mut query = QueryBuilder::new("SELECT id FROM jobs");
        push_filter(&mut query, filter);
        query.push(" ORDER BY id");
        let ids = self.fetch_strings(query).await?;

        let mut updated = Vec::new();
        for id in ids.into_iter().map(JobId::new) {
            if let Some(true) = self.patch_where(&id, patch, |job| filter.matches(job)).await? {
                updated.push(id);
            }
        }
        Ok(updated)
    }

    async fn aggregate(&self, aggregation: &Aggregation) -> Result<Vec<AggregateRow>, StorageError> {
        match aggregation {
            Aggregation::SubmittedJobTypes => {
                let mut query = QueryBuilder::new("SELECT DISTINCT job_type FROM jobs");
                query.push(SUBMITTED_CLAUSE).push(" ORDER BY job_type");
                let types = self.fetch_strings(query).await?;
                Ok(types.into_iter().map(AggregateRow::JobType).collect())
            }
            Aggregation::SubmittedOrganizations { job_types } => {
                let mut query = QueryBuilder::new("SELECT DISTINCT organization_id FROM jobs");
                query.push(SUBMITTED_CLAUSE);
                push_in(&mut query, "job_type", job_types.iter().cloned());
                query.push(" ORDER BY organization_id");
                let orgs = self.fetch_strings(query).await?;
                Ok(orgs
                    .into_iter()
                    .map(|o| AggregateRow::Organization(OrganizationId::new(o)))
                    .collect())
            }
            Aggregation::Count(filter) => {
                let mut query = QueryBuilder::new("SELECT COUNT(*) FROM jobs");
                push_filter(&mut query, filter);
                let (count,): (i64,) = query
                    .build_query_as()
                    .fetch_one(&self.pool)
                    .await
                    .map_err(map_sqlx_error)?;
                Ok(vec![AggregateRow::Count(count.max(0) as u64)])
            }
            Aggregation::AdmissionCandidates {
                job_types,
                organization_id,
                limit,
            } => {
                let mut query = QueryBuilder::new(
                    "SELECT id FROM (SELECT id, priority, creation_time, ROW_NUMBER() OVER \
                     (PARTITION BY job_key ORDER BY priority DESC, creation_time ASC, id ASC) AS rn \
                     FROM jobs j",
                );
                query.push(SUBMITTED_CLAUSE);
                push_in(&mut query, "job_type", job_types.iter().cloned());
                if let Some(org) = organization_id {
                    query.push(" AND organization_id = ").push_bind(org.to_string());
                }
                query.push(
                    " AND NOT EXISTS (SELECT 1 FROM jobs h WHERE h.job_key = j.job_key \
                     AND h.is_cancelled = 0",
                );
                push_in(
                    &mut query,
                    "h.state",
                    IN_FLIGHT_STATES.iter().map(|s| s.as_str().to_string()),
                );
                query.push(")) WHERE rn = 1 ORDER BY priority DESC, creation_time ASC, id ASC LIMIT ");
                query.push_bind(*limit as i64);

                let ids = self.fetch_strings(query).await?;
                Ok(ids
                    .into_iter()
                    .map(|id| AggregateRow::Candidate(JobId::new(id)))
                    .collect())
            }
            Aggregation::ActiveTenants => {
                let rows: Vec<(String, String)> = sqlx::query_as(
                    r#"
                    SELECT DISTINCT organization_id, workspace_id FROM jobs
                    WHERE state NOT IN ('done', 'failed', 'cancelled')
                    ORDER BY organization_id, workspace_id
                    "#,
                )
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
                Ok(rows
                    .into_iter()
                    .map(|(org, ws)| {
                        AggregateRow::Tenant(Tenant::new(
                            OrganizationId::new(org),
                            WorkspaceId::new(ws),
                        ))
                    })
                    .collect())
            }
        }
    }

    async fn delete_many(&self, filter: &JobFilter) -> Result<u64, StorageError> {
        if filter.is_empty() {
            return Err(StorageError::UnfilteredDelete);
        }
        let mut query = QueryBuilder::new("DELETE FROM jobs");
        push_filter(&mut query, filter);
        let result = query
            .build()
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl JobSubmitter for SqliteJobStore {
    async fn submit(&self, job: Job) -> Result<(), StorageError> {
        let doc = encode(&job)?;
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (id, organization_id, workspace_id, job_type, job_key, state,
                              priority, creation_time, is_cancelled, gpu_reserved,
                              main_execution_id, revert_execution_id, doc)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id.as_str())
        .bind(job.organization_id.as_str())
        .bind(job.workspace_id.as_str())
        .bind(&job.job_type)
        .bind(&job.key)
        .bind(job.state.as_str())
        .bind(job.priority)
        .bind(job.creation_time.timestamp_micros())
        .bind(job.is_cancelled())
        .bind(job.gpu_reserved)
        .bind(job.executions.main.execution_id.as_ref().map(|e| e.as_str()))
        .bind(job.executions.revert.execution_id.as_ref().map(|e| e.as_str()))
        .bind(doc)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StorageError::DuplicateKey(format!("job: {}", job.id)))
            }
            Err(e) => Err(map_sqlx_error(e)),
        }
    }
}
