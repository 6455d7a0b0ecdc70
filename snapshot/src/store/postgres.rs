use chrono::{DateTime, Utc};
use snapshot_config::shared::{IntoConnectOptions, PgConnectionConfig};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::prelude::FromRow;
use sqlx::{PgPool, Type};
use std::str::FromStr;
use std::time::Duration;
use tokio_postgres::types::PgLsn;
use tracing::{debug, info};

use crate::error::{ErrorKind, SnapshotError, SnapshotResult};
use crate::store::base::MetadataStore;
use crate::types::{
    Chunk, ChunkBounds, ChunkId, ChunkPlan, ChunkStatus, JobId, JobProgress, JobStatus,
    ReclaimOutcome, SnapshotJob, TableName, ViewToken, WorkerId,
};
use crate::{bail, snapshot_error};

/// Database enum type for job statuses.
#[derive(Debug, Clone, Copy, Type, PartialEq)]
#[sqlx(type_name = "snapshot.job_status", rename_all = "snake_case")]
enum JobStatusType {
    Planning,
    Exporting,
    Running,
    Completed,
    Failed,
}

impl From<JobStatus> for JobStatusType {
    fn from(value: JobStatus) -> Self {
        match value {
            JobStatus::Planning => JobStatusType::Planning,
            JobStatus::Exporting => JobStatusType::Exporting,
            JobStatus::Running => JobStatusType::Running,
            JobStatus::Completed => JobStatusType::Completed,
            JobStatus::Failed => JobStatusType::Failed,
        }
    }
}

impl From<JobStatusType> for JobStatus {
    fn from(value: JobStatusType) -> Self {
        match value {
            JobStatusType::Planning => JobStatus::Planning,
            JobStatusType::Exporting => JobStatus::Exporting,
            JobStatusType::Running => JobStatus::Running,
            JobStatusType::Completed => JobStatus::Completed,
            JobStatusType::Failed => JobStatus::Failed,
        }
    }
}

/// Database enum type for chunk statuses.
#[derive(Debug, Clone, Copy, Type, PartialEq)]
#[sqlx(type_name = "snapshot.chunk_status", rename_all = "snake_case")]
enum ChunkStatusType {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl From<ChunkStatusType> for ChunkStatus {
    fn from(value: ChunkStatusType) -> Self {
        match value {
            ChunkStatusType::Pending => ChunkStatus::Pending,
            ChunkStatusType::InProgress => ChunkStatus::InProgress,
            ChunkStatusType::Completed => ChunkStatus::Completed,
            ChunkStatusType::Failed => ChunkStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, Type, PartialEq)]
#[sqlx(type_name = "snapshot.chunk_bound_kind", rename_all = "snake_case")]
enum ChunkBoundKind {
    Offset,
    Range,
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: i64,
    endpoint: String,
    status: JobStatusType,
    fence_lsn: String,
    view_token: Option<String>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for SnapshotJob {
    type Error = SnapshotError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let fence_lsn = PgLsn::from_str(&row.fence_lsn).map_err(|_| {
            snapshot_error!(
                ErrorKind::InvalidData,
                "Invalid fence LSN in the metadata store",
                format!("job {} has fence LSN '{}'", row.id, row.fence_lsn)
            )
        })?;

        Ok(SnapshotJob {
            id: row.id,
            endpoint: row.endpoint,
            status: row.status.into(),
            fence_lsn,
            view_token: row.view_token.map(ViewToken::new),
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ChunkRow {
    id: i64,
    job_id: i64,
    table_schema: String,
    table_name: String,
    order_by: Vec<String>,
    bound_kind: ChunkBoundKind,
    bound_start: Option<i64>,
    bound_end: Option<i64>,
    status: ChunkStatusType,
    claimed_by: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    heartbeat_at: Option<DateTime<Utc>>,
    attempts: i32,
    last_error: Option<String>,
}

impl TryFrom<ChunkRow> for Chunk {
    type Error = SnapshotError;

    fn try_from(row: ChunkRow) -> Result<Self, Self::Error> {
        let bounds = match row.bound_kind {
            ChunkBoundKind::Range => ChunkBounds::Range {
                start: row.bound_start,
                end: row.bound_end,
            },
            ChunkBoundKind::Offset => {
                let Some(start) = row.bound_start else {
                    bail!(
                        ErrorKind::InvalidData,
                        "Offset chunk without a start offset",
                        format!("chunk {} has no start offset", row.id)
                    );
                };

                ChunkBounds::Offset {
                    start,
                    end: row.bound_end,
                }
            }
        };

        let attempts = u32::try_from(row.attempts).map_err(|_| {
            snapshot_error!(
                ErrorKind::InvalidData,
                "Negative chunk attempt counter",
                format!("chunk {} has {} attempts", row.id, row.attempts)
            )
        })?;

        Ok(Chunk {
            id: row.id,
            job_id: row.job_id,
            table: TableName::new(row.table_schema, row.table_name),
            order_by: row.order_by,
            bounds,
            status: row.status.into(),
            claimed_by: row.claimed_by.map(WorkerId::from),
            claimed_at: row.claimed_at,
            heartbeat_at: row.heartbeat_at,
            attempts,
            last_error: row.last_error,
        })
    }
}

fn split_bounds(bounds: &ChunkBounds) -> (ChunkBoundKind, Option<i64>, Option<i64>) {
    match *bounds {
        ChunkBounds::Offset { start, end } => (ChunkBoundKind::Offset, Some(start), end),
        ChunkBounds::Range { start, end } => (ChunkBoundKind::Range, start, end),
    }
}

/// [`MetadataStore`] persisted in the `snapshot` schema of a Postgres database.
///
/// All instances of an endpoint point at the same database. Claims rely on
/// `for update skip locked` so concurrent claimers never block on each other nor obtain the
/// same chunk, and every transition is a conditional `update` whose affected row count tells
/// whether it applied.
#[derive(Debug, Clone)]
pub struct PostgresMetadataStore {
    pool: PgPool,
}

impl PostgresMetadataStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to the metadata database with a pool of at most `max_connections`.
    ///
    /// Migrations must have been applied beforehand.
    pub async fn connect(
        config: &PgConnectionConfig,
        max_connections: u32,
    ) -> SnapshotResult<Self> {
        let options: PgConnectOptions = config.with_db();

        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        info!(
            host = %config.host,
            database = %config.name,
            "connected to the snapshot metadata store"
        );

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl MetadataStore for PostgresMetadataStore {
    async fn latest_job(&self, endpoint: &str) -> SnapshotResult<Option<SnapshotJob>> {
        let row: Option<JobRow> = sqlx::query_as(
            r#"
            select id, endpoint, status, fence_lsn, view_token, failure_reason, created_at, updated_at
            from snapshot.jobs
            where endpoint = $1
            order by id desc
            limit 1
            "#,
        )
        .bind(endpoint)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SnapshotJob::try_from).transpose()
    }

    async fn get_job(&self, job_id: JobId) -> SnapshotResult<Option<SnapshotJob>> {
        let row: Option<JobRow> = sqlx::query_as(
            r#"
            select id, endpoint, status, fence_lsn, view_token, failure_reason, created_at, updated_at
            from snapshot.jobs
            where id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SnapshotJob::try_from).transpose()
    }

    async fn create_job(&self, endpoint: &str, fence_lsn: PgLsn) -> SnapshotResult<SnapshotJob> {
        // The partial unique index on live jobs turns a concurrent creation into a unique
        // violation, which converts into `LiveJobExists`.
        let row: JobRow = sqlx::query_as(
            r#"
            insert into snapshot.jobs (endpoint, status, fence_lsn)
            values ($1, 'planning', $2)
            returning id, endpoint, status, fence_lsn, view_token, failure_reason, created_at, updated_at
            "#,
        )
        .bind(endpoint)
        .bind(fence_lsn.to_string())
        .fetch_one(&self.pool)
        .await?;

        debug!(job_id = row.id, endpoint, %fence_lsn, "created snapshot job");

        row.try_into()
    }

    async fn store_plan(&self, job_id: JobId, chunks: Vec<ChunkPlan>) -> SnapshotResult<u64> {
        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query(
            r#"
            update snapshot.jobs
            set status = 'exporting', updated_at = now()
            where id = $1 and status = 'planning'
            "#,
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        if moved.rows_affected() == 0 {
            bail!(
                ErrorKind::InvalidJobTransition,
                "The job is not planning anymore",
                format!("cannot store the plan of job {job_id}")
            );
        }

        let count = chunks.len() as u64;
        for plan in chunks {
            let (kind, start, end) = split_bounds(&plan.bounds);

            sqlx::query(
                r#"
                insert into snapshot.chunks
                    (job_id, table_schema, table_name, order_by, bound_kind, bound_start, bound_end)
                values ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(job_id)
            .bind(plan.table.schema)
            .bind(plan.table.name)
            .bind(plan.order_by)
            .bind(kind)
            .bind(start)
            .bind(end)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(count)
    }

    async fn publish_view_token(&self, job_id: JobId, token: &ViewToken) -> SnapshotResult<bool> {
        let result = sqlx::query(
            r#"
            update snapshot.jobs
            set status = 'running', view_token = $2, updated_at = now()
            where id = $1 and status = 'exporting'
            "#,
        )
        .bind(job_id)
        .bind(token.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn transition_job(
        &self,
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    ) -> SnapshotResult<bool> {
        if !from.can_transition_to(to) {
            return Ok(false);
        }

        let result = sqlx::query(
            r#"
            update snapshot.jobs
            set status = $3, updated_at = now()
            where id = $1 and status = $2
            "#,
        )
        .bind(job_id)
        .bind(JobStatusType::from(from))
        .bind(JobStatusType::from(to))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn fail_job(&self, job_id: JobId, reason: &str) -> SnapshotResult<bool> {
        let mut tx = self.pool.begin().await?;

        let failed = sqlx::query(
            r#"
            update snapshot.jobs
            set status = 'failed', failure_reason = $2, updated_at = now()
            where id = $1 and status in ('planning', 'exporting', 'running')
            "#,
        )
        .bind(job_id)
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        if failed.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query("delete from snapshot.chunks where job_id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(true)
    }

    async fn reclaim_stale_chunks(
        &self,
        job_id: JobId,
        claim_timeout: Duration,
        max_attempts: u32,
    ) -> SnapshotResult<ReclaimOutcome> {
        let statuses: Vec<ChunkStatusType> = sqlx::query_scalar(
            r#"
            with stale as (
                select id
                from snapshot.chunks
                where job_id = $1
                    and status = 'in_progress'
                    and heartbeat_at < now() - make_interval(secs => $2)
                for update skip locked
            )
            update snapshot.chunks c
            set status = case
                    when c.attempts >= $3 then 'failed'::snapshot.chunk_status
                    else 'pending'::snapshot.chunk_status
                end,
                claimed_by = null,
                claimed_at = null,
                heartbeat_at = null,
                updated_at = now()
            from stale
            where c.id = stale.id
            returning c.status
            "#,
        )
        .bind(job_id)
        .bind(claim_timeout.as_secs_f64())
        .bind(i32::try_from(max_attempts).unwrap_or(i32::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut outcome = ReclaimOutcome::default();
        for status in statuses {
            match status {
                ChunkStatusType::Failed => outcome.exhausted += 1,
                _ => outcome.reclaimed += 1,
            }
        }

        Ok(outcome)
    }

    async fn claim_chunk(&self, job_id: JobId, worker: &WorkerId) -> SnapshotResult<Option<Chunk>> {
        let row: Option<ChunkRow> = sqlx::query_as(
            r#"
            update snapshot.chunks
            set status = 'in_progress',
                claimed_by = $2,
                claimed_at = now(),
                heartbeat_at = now(),
                attempts = attempts + 1,
                updated_at = now()
            where id = (
                select c.id
                from snapshot.chunks c
                join snapshot.jobs j on j.id = c.job_id
                where c.job_id = $1 and c.status = 'pending' and j.status = 'running'
                order by c.id
                limit 1
                for update of c skip locked
            )
            returning id, job_id, table_schema, table_name, order_by, bound_kind, bound_start,
                bound_end, status, claimed_by, claimed_at, heartbeat_at, attempts, last_error
            "#,
        )
        .bind(job_id)
        .bind(worker.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Chunk::try_from).transpose()
    }

    async fn heartbeat_chunk(&self, chunk_id: ChunkId, worker: &WorkerId) -> SnapshotResult<bool> {
        let result = sqlx::query(
            r#"
            update snapshot.chunks
            set heartbeat_at = now()
            where id = $1 and status = 'in_progress' and claimed_by = $2
            "#,
        )
        .bind(chunk_id)
        .bind(worker.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete_chunk(&self, chunk_id: ChunkId, worker: &WorkerId) -> SnapshotResult<bool> {
        let result = sqlx::query(
            r#"
            update snapshot.chunks
            set status = 'completed',
                claimed_by = null,
                claimed_at = null,
                heartbeat_at = null,
                last_error = null,
                updated_at = now()
            where id = $1 and status = 'in_progress' and claimed_by = $2
            "#,
        )
        .bind(chunk_id)
        .bind(worker.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_chunk(&self, chunk_id: ChunkId, worker: &WorkerId) -> SnapshotResult<bool> {
        let result = sqlx::query(
            r#"
            update snapshot.chunks
            set status = 'pending',
                claimed_by = null,
                claimed_at = null,
                heartbeat_at = null,
                updated_at = now()
            where id = $1 and status = 'in_progress' and claimed_by = $2
            "#,
        )
        .bind(chunk_id)
        .bind(worker.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_chunk_error(
        &self,
        chunk_id: ChunkId,
        worker: &WorkerId,
        error: &str,
    ) -> SnapshotResult<bool> {
        let result = sqlx::query(
            r#"
            update snapshot.chunks
            set last_error = $3, updated_at = now()
            where id = $1 and status = 'in_progress' and claimed_by = $2
            "#,
        )
        .bind(chunk_id)
        .bind(worker.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn job_chunks(&self, job_id: JobId) -> SnapshotResult<Vec<Chunk>> {
        let rows: Vec<ChunkRow> = sqlx::query_as(
            r#"
            select id, job_id, table_schema, table_name, order_by, bound_kind, bound_start,
                bound_end, status, claimed_by, claimed_at, heartbeat_at, attempts, last_error
            from snapshot.chunks
            where job_id = $1
            order by id
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Chunk::try_from).collect()
    }

    async fn job_progress(&self, job_id: JobId) -> SnapshotResult<JobProgress> {
        let counts: Vec<(ChunkStatusType, i64)> = sqlx::query_as(
            r#"
            select status, count(*)
            from snapshot.chunks
            where job_id = $1
            group by status
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        let mut progress = JobProgress::default();
        for (status, count) in counts {
            let count = count as u64;
            match status {
                ChunkStatusType::Pending => progress.pending = count,
                ChunkStatusType::InProgress => progress.in_progress = count,
                ChunkStatusType::Completed => progress.completed = count,
                ChunkStatusType::Failed => progress.failed = count,
            }
        }

        Ok(progress)
    }
}
