use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_postgres::types::PgLsn;

use crate::bail;
use crate::error::{ErrorKind, SnapshotResult};
use crate::store::base::MetadataStore;
use crate::types::{
    Chunk, ChunkId, ChunkPlan, ChunkStatus, JobId, JobProgress, JobStatus, ReclaimOutcome,
    SnapshotJob, ViewToken, WorkerId,
};

#[derive(Debug, Default)]
struct Inner {
    jobs: BTreeMap<JobId, SnapshotJob>,
    chunks: BTreeMap<ChunkId, Chunk>,
    next_job_id: JobId,
    next_chunk_id: ChunkId,
}

impl Inner {
    fn job_mut(&mut self, job_id: JobId) -> Option<&mut SnapshotJob> {
        self.jobs.get_mut(&job_id)
    }

    fn transition(&mut self, job_id: JobId, from: JobStatus, to: JobStatus) -> bool {
        let Some(job) = self.job_mut(job_id) else {
            return false;
        };

        if job.status != from || !from.can_transition_to(to) {
            return false;
        }

        job.status = to;
        job.updated_at = Utc::now();

        true
    }

    fn claimed_chunk_mut(&mut self, chunk_id: ChunkId, worker: &WorkerId) -> Option<&mut Chunk> {
        self.chunks.get_mut(&chunk_id).filter(|chunk| {
            chunk.status == ChunkStatus::InProgress && chunk.claimed_by.as_ref() == Some(worker)
        })
    }
}

fn clear_claim(chunk: &mut Chunk) {
    chunk.claimed_by = None;
    chunk.claimed_at = None;
    chunk.heartbeat_at = None;
}

/// In-memory [`MetadataStore`].
///
/// Shared between instances of the same process through cloning. Used by tests and by local
/// runs where all instances live in one process.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetadataStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every job ever created for `endpoint`, oldest first.
    pub async fn jobs(&self, endpoint: &str) -> Vec<SnapshotJob> {
        let inner = self.inner.lock().await;
        inner
            .jobs
            .values()
            .filter(|job| job.endpoint == endpoint)
            .cloned()
            .collect()
    }
}

impl MetadataStore for MemoryMetadataStore {
    async fn latest_job(&self, endpoint: &str) -> SnapshotResult<Option<SnapshotJob>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .jobs
            .values()
            .rev()
            .find(|job| job.endpoint == endpoint)
            .cloned())
    }

    async fn get_job(&self, job_id: JobId) -> SnapshotResult<Option<SnapshotJob>> {
        let inner = self.inner.lock().await;

        Ok(inner.jobs.get(&job_id).cloned())
    }

    async fn create_job(&self, endpoint: &str, fence_lsn: PgLsn) -> SnapshotResult<SnapshotJob> {
        let mut inner = self.inner.lock().await;

        if let Some(live) = inner
            .jobs
            .values()
            .find(|job| job.endpoint == endpoint && job.status.is_live())
        {
            bail!(
                ErrorKind::LiveJobExists,
                "A live snapshot job already exists",
                format!("job {} of endpoint '{endpoint}' is {}", live.id, live.status)
            );
        }

        inner.next_job_id += 1;
        let now = Utc::now();
        let job = SnapshotJob {
            id: inner.next_job_id,
            endpoint: endpoint.to_string(),
            status: JobStatus::Planning,
            fence_lsn,
            view_token: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        inner.jobs.insert(job.id, job.clone());

        Ok(job)
    }

    async fn store_plan(&self, job_id: JobId, chunks: Vec<ChunkPlan>) -> SnapshotResult<u64> {
        let mut inner = self.inner.lock().await;

        if !inner.transition(job_id, JobStatus::Planning, JobStatus::Exporting) {
            bail!(
                ErrorKind::InvalidJobTransition,
                "The job is not planning anymore",
                format!("cannot store the plan of job {job_id}")
            );
        }

        let count = chunks.len() as u64;
        for plan in chunks {
            inner.next_chunk_id += 1;
            let chunk = Chunk {
                id: inner.next_chunk_id,
                job_id,
                table: plan.table,
                order_by: plan.order_by,
                bounds: plan.bounds,
                status: ChunkStatus::Pending,
                claimed_by: None,
                claimed_at: None,
                heartbeat_at: None,
                attempts: 0,
                last_error: None,
            };
            inner.chunks.insert(chunk.id, chunk);
        }

        Ok(count)
    }

    async fn publish_view_token(&self, job_id: JobId, token: &ViewToken) -> SnapshotResult<bool> {
        let mut inner = self.inner.lock().await;

        if !inner.transition(job_id, JobStatus::Exporting, JobStatus::Running) {
            return Ok(false);
        }

        if let Some(job) = inner.job_mut(job_id) {
            job.view_token = Some(token.clone());
        }

        Ok(true)
    }

    async fn transition_job(
        &self,
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    ) -> SnapshotResult<bool> {
        let mut inner = self.inner.lock().await;

        Ok(inner.transition(job_id, from, to))
    }

    async fn fail_job(&self, job_id: JobId, reason: &str) -> SnapshotResult<bool> {
        let mut inner = self.inner.lock().await;

        let Some(job) = inner.job_mut(job_id) else {
            return Ok(false);
        };

        if job.status.is_terminal() {
            return Ok(false);
        }

        job.status = JobStatus::Failed;
        job.failure_reason = Some(reason.to_string());
        job.updated_at = Utc::now();

        inner.chunks.retain(|_, chunk| chunk.job_id != job_id);

        Ok(true)
    }

    async fn reclaim_stale_chunks(
        &self,
        job_id: JobId,
        claim_timeout: Duration,
        max_attempts: u32,
    ) -> SnapshotResult<ReclaimOutcome> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut outcome = ReclaimOutcome::default();

        for chunk in inner.chunks.values_mut() {
            if chunk.job_id != job_id || chunk.status != ChunkStatus::InProgress {
                continue;
            }

            let stale = chunk.heartbeat_at.is_none_or(|heartbeat_at| {
                (now - heartbeat_at)
                    .to_std()
                    .is_ok_and(|age| age > claim_timeout)
            });
            if !stale {
                continue;
            }

            clear_claim(chunk);
            if chunk.attempts >= max_attempts {
                chunk.status = ChunkStatus::Failed;
                outcome.exhausted += 1;
            } else {
                chunk.status = ChunkStatus::Pending;
                outcome.reclaimed += 1;
            }
        }

        Ok(outcome)
    }

    async fn claim_chunk(&self, job_id: JobId, worker: &WorkerId) -> SnapshotResult<Option<Chunk>> {
        let mut inner = self.inner.lock().await;

        let running = inner
            .jobs
            .get(&job_id)
            .is_some_and(|job| job.status == JobStatus::Running);
        if !running {
            return Ok(None);
        }

        let now = Utc::now();
        let Some(chunk) = inner
            .chunks
            .values_mut()
            .find(|chunk| chunk.job_id == job_id && chunk.status == ChunkStatus::Pending)
        else {
            return Ok(None);
        };

        chunk.status = ChunkStatus::InProgress;
        chunk.claimed_by = Some(worker.clone());
        chunk.claimed_at = Some(now);
        chunk.heartbeat_at = Some(now);
        chunk.attempts += 1;

        Ok(Some(chunk.clone()))
    }

    async fn heartbeat_chunk(&self, chunk_id: ChunkId, worker: &WorkerId) -> SnapshotResult<bool> {
        let mut inner = self.inner.lock().await;

        let Some(chunk) = inner.claimed_chunk_mut(chunk_id, worker) else {
            return Ok(false);
        };
        chunk.heartbeat_at = Some(Utc::now());

        Ok(true)
    }

    async fn complete_chunk(&self, chunk_id: ChunkId, worker: &WorkerId) -> SnapshotResult<bool> {
        let mut inner = self.inner.lock().await;

        let Some(chunk) = inner.claimed_chunk_mut(chunk_id, worker) else {
            return Ok(false);
        };
        chunk.status = ChunkStatus::Completed;
        chunk.last_error = None;
        clear_claim(chunk);

        Ok(true)
    }

    async fn release_chunk(&self, chunk_id: ChunkId, worker: &WorkerId) -> SnapshotResult<bool> {
        let mut inner = self.inner.lock().await;

        let Some(chunk) = inner.claimed_chunk_mut(chunk_id, worker) else {
            return Ok(false);
        };
        chunk.status = ChunkStatus::Pending;
        clear_claim(chunk);

        Ok(true)
    }

    async fn record_chunk_error(
        &self,
        chunk_id: ChunkId,
        worker: &WorkerId,
        error: &str,
    ) -> SnapshotResult<bool> {
        let mut inner = self.inner.lock().await;

        let Some(chunk) = inner.claimed_chunk_mut(chunk_id, worker) else {
            return Ok(false);
        };
        chunk.last_error = Some(error.to_string());

        Ok(true)
    }

    async fn job_chunks(&self, job_id: JobId) -> SnapshotResult<Vec<Chunk>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .chunks
            .values()
            .filter(|chunk| chunk.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn job_progress(&self, job_id: JobId) -> SnapshotResult<JobProgress> {
        let inner = self.inner.lock().await;

        let mut progress = JobProgress::default();
        for chunk in inner.chunks.values().filter(|chunk| chunk.job_id == job_id) {
            match chunk.status {
                ChunkStatus::Pending => progress.pending += 1,
                ChunkStatus::InProgress => progress.in_progress += 1,
                ChunkStatus::Completed => progress.completed += 1,
                ChunkStatus::Failed => progress.failed += 1,
            }
        }

        Ok(progress)
    }
}
