use std::future::Future;
use std::time::Duration;
use tokio_postgres::types::PgLsn;

use crate::error::SnapshotResult;
use crate::types::{
    Chunk, ChunkId, ChunkPlan, JobId, JobProgress, JobStatus, ReclaimOutcome, SnapshotJob,
    ViewToken, WorkerId,
};

/// Durable, transactional storage of snapshot jobs and chunks shared by all instances.
///
/// Every status change is a conditional update: it only applies when the record is in the
/// expected state (and, for chunks, when the caller still owns the claim). The boolean returned
/// by those methods tells whether the update applied. Implementations must make claims exclusive
/// under concurrent callers, including callers in other processes.
pub trait MetadataStore {
    /// Returns the most recently created job of `endpoint`, whatever its status.
    fn latest_job(
        &self,
        endpoint: &str,
    ) -> impl Future<Output = SnapshotResult<Option<SnapshotJob>>> + Send;

    fn get_job(
        &self,
        job_id: JobId,
    ) -> impl Future<Output = SnapshotResult<Option<SnapshotJob>>> + Send;

    /// Creates a job in [`JobStatus::Planning`] fenced at `fence_lsn`.
    ///
    /// Fails with [`crate::error::ErrorKind::LiveJobExists`] when `endpoint` already has a
    /// job in a non-terminal status.
    fn create_job(
        &self,
        endpoint: &str,
        fence_lsn: PgLsn,
    ) -> impl Future<Output = SnapshotResult<SnapshotJob>> + Send;

    /// Persists all chunks of a plan and moves the job from planning to exporting, atomically.
    ///
    /// Returns the number of chunks stored. Fails with
    /// [`crate::error::ErrorKind::InvalidJobTransition`] if the job is no longer planning, in
    /// which case nothing is stored.
    fn store_plan(
        &self,
        job_id: JobId,
        chunks: Vec<ChunkPlan>,
    ) -> impl Future<Output = SnapshotResult<u64>> + Send;

    /// Records the exported view token and moves the job from exporting to running.
    fn publish_view_token(
        &self,
        job_id: JobId,
        token: &ViewToken,
    ) -> impl Future<Output = SnapshotResult<bool>> + Send;

    /// Moves the job from `from` to `to` if it is still in `from`.
    fn transition_job(
        &self,
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    ) -> impl Future<Output = SnapshotResult<bool>> + Send;

    /// Marks a live job failed and discards all its chunks in one transaction.
    ///
    /// Returns `false` when the job was already terminal.
    fn fail_job(
        &self,
        job_id: JobId,
        reason: &str,
    ) -> impl Future<Output = SnapshotResult<bool>> + Send;

    /// Releases in-progress claims whose heartbeat is older than `claim_timeout`.
    ///
    /// A released chunk goes back to pending, unless it has already been claimed
    /// `max_attempts` times, in which case it is marked failed.
    fn reclaim_stale_chunks(
        &self,
        job_id: JobId,
        claim_timeout: Duration,
        max_attempts: u32,
    ) -> impl Future<Output = SnapshotResult<ReclaimOutcome>> + Send;

    /// Claims one pending chunk of the job for `worker`, skipping chunks other callers are
    /// claiming concurrently. Increments the attempt counter.
    fn claim_chunk(
        &self,
        job_id: JobId,
        worker: &WorkerId,
    ) -> impl Future<Output = SnapshotResult<Option<Chunk>>> + Send;

    /// Refreshes the heartbeat of a claim. Returns `false` when `worker` lost the claim.
    fn heartbeat_chunk(
        &self,
        chunk_id: ChunkId,
        worker: &WorkerId,
    ) -> impl Future<Output = SnapshotResult<bool>> + Send;

    /// Marks a claimed chunk completed.
    fn complete_chunk(
        &self,
        chunk_id: ChunkId,
        worker: &WorkerId,
    ) -> impl Future<Output = SnapshotResult<bool>> + Send;

    /// Gives a claim back, returning the chunk to pending without waiting for the claim timeout.
    fn release_chunk(
        &self,
        chunk_id: ChunkId,
        worker: &WorkerId,
    ) -> impl Future<Output = SnapshotResult<bool>> + Send;

    /// Records the error of a failed read, leaving the claim in place until it goes stale.
    fn record_chunk_error(
        &self,
        chunk_id: ChunkId,
        worker: &WorkerId,
        error: &str,
    ) -> impl Future<Output = SnapshotResult<bool>> + Send;

    /// Returns all chunks of a job ordered by id.
    fn job_chunks(&self, job_id: JobId) -> impl Future<Output = SnapshotResult<Vec<Chunk>>> + Send;

    fn job_progress(
        &self,
        job_id: JobId,
    ) -> impl Future<Output = SnapshotResult<JobProgress>> + Send;
}
