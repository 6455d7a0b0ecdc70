use snapshot_config::shared::SnapshotConfig;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

use crate::concurrency::shutdown::{ShutdownRx, is_shutdown_requested};
use crate::destination::Destination;
use crate::error::{ErrorKind, SnapshotError, SnapshotResult};
use crate::snapshot_error;
use crate::source::base::{SnapshotSource, ViewReader};
use crate::store::base::MetadataStore;
use crate::types::{
    Chunk, ChunkBeginEvent, ChunkEndEvent, Event, JobStatus, RunningJob, SnapshotDataEvent,
    TableRow, WorkerId,
};
use crate::utils::retry::with_retry;
use crate::workers::heartbeat::HeartbeatGuard;

/// Why a chunk worker stopped.
///
/// Variants are ordered by precedence: when several workers of a pool stop for different
/// reasons, the pool reports the greatest one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChunkWorkerExit {
    /// No claimable chunk is left and the job is still running.
    Drained,
    /// The job left the running status, either completed or failed.
    JobClosed,
    /// The exported view could not be adopted anymore. The job has been marked failed.
    ViewLost,
    /// Shutdown was requested. An in-flight chunk has been given back.
    Shutdown,
}

/// What happened to one claimed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkOutcome {
    Completed,
    /// The read failed. The claim is left to go stale so the chunk is retried later.
    ReadFailed,
    /// Another worker took the chunk over while it was being read.
    ClaimLost,
    ViewLost,
    Shutdown,
}

#[derive(Debug)]
pub struct ChunkWorkerHandle {
    handle: Option<JoinHandle<SnapshotResult<ChunkWorkerExit>>>,
}

impl ChunkWorkerHandle {
    /// Waits for the worker to stop. A panic inside the worker surfaces as
    /// [`ErrorKind::ChunkWorkerPanic`].
    pub async fn wait(mut self) -> SnapshotResult<ChunkWorkerExit> {
        let Some(handle) = self.handle.as_mut() else {
            return Ok(ChunkWorkerExit::Drained);
        };

        let result = handle.await;
        self.handle = None;

        match result {
            Ok(result) => result,
            Err(err) => Err(snapshot_error!(
                ErrorKind::ChunkWorkerPanic,
                "A chunk worker panicked",
                err
            )),
        }
    }
}

impl Drop for ChunkWorkerHandle {
    /// A worker never outlives its handle. When the pipeline is dropped mid-chunk, the worker
    /// and its heartbeat stop and the claim goes stale.
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Claims chunks of a running job one at a time and delivers their rows to the destination.
#[derive(Debug)]
pub struct ChunkWorker<S, M, D> {
    worker_id: WorkerId,
    job: RunningJob,
    config: Arc<SnapshotConfig>,
    source: S,
    store: M,
    destination: D,
    shutdown_rx: ShutdownRx,
}

impl<S, M, D> ChunkWorker<S, M, D>
where
    S: SnapshotSource,
    M: MetadataStore + Clone + Send + Sync + 'static,
    D: Destination + Clone + Send + Sync + 'static,
{
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        worker_id: WorkerId,
        job: RunningJob,
        config: Arc<SnapshotConfig>,
        source: S,
        store: M,
        destination: D,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            worker_id,
            job,
            config,
            source,
            store,
            destination,
            shutdown_rx,
        }
    }

    /// Spawns the worker on the runtime.
    pub fn start(self) -> ChunkWorkerHandle {
        let span = tracing::info_span!(
            "chunk_worker",
            worker_id = %self.worker_id,
            job_id = self.job.id
        );
        let handle = tokio::spawn(self.run().instrument(span));

        ChunkWorkerHandle {
            handle: Some(handle),
        }
    }

    /// Runs the claim loop until nothing is left to claim, the job closes or shutdown is
    /// requested.
    pub async fn run(mut self) -> SnapshotResult<ChunkWorkerExit> {
        info!("starting chunk worker");

        loop {
            if is_shutdown_requested(&self.shutdown_rx) {
                info!("shutdown requested, stopping chunk worker");
                return Ok(ChunkWorkerExit::Shutdown);
            }

            let outcome = with_retry(
                &self.config.store_retry,
                "reclaiming stale chunks",
                || {
                    self.store.reclaim_stale_chunks(
                        self.job.id,
                        self.config.claim_timeout(),
                        self.config.max_chunk_attempts,
                    )
                },
            )
            .await?;

            if outcome.reclaimed > 0 {
                info!(reclaimed = outcome.reclaimed, "reclaimed stale chunks");
            }

            if outcome.exhausted > 0 {
                let err = snapshot_error!(
                    ErrorKind::ChunkRetriesExhausted,
                    "Chunks used up their attempts",
                    format!(
                        "{} chunks of job {} failed {} times",
                        outcome.exhausted, self.job.id, self.config.max_chunk_attempts
                    )
                );
                error!(error = %err, "failing snapshot job");
                self.store.fail_job(self.job.id, &err.to_string()).await?;

                return Ok(ChunkWorkerExit::JobClosed);
            }

            let claimed = with_retry(&self.config.store_retry, "claiming a chunk", || {
                self.store.claim_chunk(self.job.id, &self.worker_id)
            })
            .await?;

            let Some(chunk) = claimed else {
                let job = self.store.get_job(self.job.id).await?;
                let exit = match job {
                    Some(job) if job.status == JobStatus::Running => ChunkWorkerExit::Drained,
                    _ => ChunkWorkerExit::JobClosed,
                };
                info!(?exit, "no chunk left to claim");

                return Ok(exit);
            };

            match self.process_chunk(&chunk).await? {
                ChunkOutcome::Completed | ChunkOutcome::ReadFailed | ChunkOutcome::ClaimLost => {}
                ChunkOutcome::ViewLost => return Ok(ChunkWorkerExit::ViewLost),
                ChunkOutcome::Shutdown => return Ok(ChunkWorkerExit::Shutdown),
            }
        }
    }

    async fn process_chunk(&mut self, chunk: &Chunk) -> SnapshotResult<ChunkOutcome> {
        info!(
            chunk_id = chunk.id,
            table = %chunk.table,
            bounds = %chunk.bounds,
            attempt = chunk.attempts,
            "claimed chunk"
        );

        let heartbeat = HeartbeatGuard::start(
            self.store.clone(),
            chunk.id,
            self.worker_id.clone(),
            self.config.heartbeat_interval(),
        );

        let adopted = with_retry(
            &self.config.store_retry,
            "adopting the exported view",
            || self.source.adopt_view(&self.job.view_token),
        )
        .await;

        let mut reader = match adopted {
            Ok(reader) => reader,
            Err(err) if err.kind() == ErrorKind::ViewTokenInvalid => {
                drop(heartbeat);
                warn!(chunk_id = chunk.id, error = %err, "exported view is gone, failing the job");
                self.store.fail_job(self.job.id, &err.to_string()).await?;

                return Ok(ChunkOutcome::ViewLost);
            }
            Err(err) => {
                drop(heartbeat);
                self.record_read_error(chunk, &err).await?;

                return Ok(ChunkOutcome::ReadFailed);
            }
        };

        let read = tokio::select! {
            biased;

            _ = self.shutdown_rx.changed() => None,
            rows = reader.read_chunk(chunk, self.config.chunk_size) => Some(rows),
        };

        let Some(read) = read else {
            drop(heartbeat);
            info!(chunk_id = chunk.id, "shutdown requested, giving the chunk back");
            if let Err(err) = reader.rollback().await {
                warn!(chunk_id = chunk.id, error = %err, "failed to roll back the chunk read");
            }
            self.store.release_chunk(chunk.id, &self.worker_id).await?;

            return Ok(ChunkOutcome::Shutdown);
        };

        let rows = match read {
            Ok(rows) => rows,
            Err(err) => {
                drop(heartbeat);
                if let Err(rollback_err) = reader.rollback().await {
                    warn!(chunk_id = chunk.id, error = %rollback_err, "failed to roll back the chunk read");
                }
                self.record_read_error(chunk, &err).await?;

                return Ok(ChunkOutcome::ReadFailed);
            }
        };

        if let Err(err) = reader.commit().await {
            drop(heartbeat);
            self.record_read_error(chunk, &err).await?;

            return Ok(ChunkOutcome::ReadFailed);
        }

        // The heartbeat keeps running until the chunk is completed, so the claim cannot go stale
        // while the rows are delivered.
        if heartbeat.claim_lost() || !self.store.heartbeat_chunk(chunk.id, &self.worker_id).await? {
            warn!(chunk_id = chunk.id, "claim lost while reading, discarding the rows");
            return Ok(ChunkOutcome::ClaimLost);
        }

        let row_count = rows.len() as u64;
        if let Err(err) = self.destination.write_events(self.chunk_events(chunk, rows)).await {
            drop(heartbeat);
            error!(chunk_id = chunk.id, error = %err, "failed to deliver chunk rows");
            self.store.release_chunk(chunk.id, &self.worker_id).await?;

            return Err(err);
        }

        if !self.store.complete_chunk(chunk.id, &self.worker_id).await? {
            warn!(
                chunk_id = chunk.id,
                "claim lost after the rows were delivered, the chunk will be read again"
            );
            return Ok(ChunkOutcome::ClaimLost);
        }
        drop(heartbeat);

        info!(chunk_id = chunk.id, row_count, "completed chunk");

        Ok(ChunkOutcome::Completed)
    }

    /// Brackets the rows of a chunk between its begin and end events.
    fn chunk_events(&self, chunk: &Chunk, rows: Vec<TableRow>) -> Vec<Event> {
        let fence_lsn = self.job.fence_lsn;
        let row_count = rows.len() as u64;

        let mut events = Vec::with_capacity(rows.len() + 2);
        events.push(Event::ChunkBegin(ChunkBeginEvent {
            chunk_id: chunk.id,
            table: chunk.table.clone(),
            bounds: chunk.bounds,
            fence_lsn,
        }));
        events.extend(rows.into_iter().map(|row| {
            Event::SnapshotData(SnapshotDataEvent {
                fence_lsn,
                chunk_id: chunk.id,
                table: chunk.table.clone(),
                row,
            })
        }));
        events.push(Event::ChunkEnd(ChunkEndEvent {
            chunk_id: chunk.id,
            table: chunk.table.clone(),
            row_count,
        }));

        events
    }

    async fn record_read_error(&self, chunk: &Chunk, err: &SnapshotError) -> SnapshotResult<()> {
        warn!(
            chunk_id = chunk.id,
            attempt = chunk.attempts,
            error = %err,
            "failed to read chunk, leaving it to be reclaimed"
        );

        if !self
            .store
            .record_chunk_error(chunk.id, &self.worker_id, &err.to_string())
            .await?
        {
            debug!(chunk_id = chunk.id, "claim already lost, error not recorded");
        }

        Ok(())
    }
}
