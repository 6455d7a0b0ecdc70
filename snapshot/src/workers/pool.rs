use snapshot_config::shared::SnapshotConfig;
use std::sync::Arc;
use tracing::{debug, info};

use crate::concurrency::shutdown::ShutdownRx;
use crate::destination::Destination;
use crate::error::{SnapshotError, SnapshotResult};
use crate::source::base::SnapshotSource;
use crate::store::base::MetadataStore;
use crate::types::{InstanceId, RunningJob, WorkerId};
use crate::workers::chunk::{ChunkWorker, ChunkWorkerExit};

/// Runs the chunk workers of one instance against a running job.
#[derive(Debug, Clone)]
pub struct ChunkWorkerPool<S, M, D> {
    instance_id: InstanceId,
    config: Arc<SnapshotConfig>,
    source: S,
    store: M,
    destination: D,
    shutdown_rx: ShutdownRx,
}

impl<S, M, D> ChunkWorkerPool<S, M, D>
where
    S: SnapshotSource,
    M: MetadataStore + Clone + Send + Sync + 'static,
    D: Destination + Clone + Send + Sync + 'static,
{
    pub fn new(
        instance_id: InstanceId,
        config: Arc<SnapshotConfig>,
        source: S,
        store: M,
        destination: D,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            instance_id,
            config,
            source,
            store,
            destination,
            shutdown_rx,
        }
    }

    /// Starts `max_chunk_workers` workers and waits for all of them to stop.
    ///
    /// Returns the exit with the highest precedence among the workers. Worker errors are
    /// collected and returned together once every worker stopped.
    pub async fn run(&self, job: &RunningJob) -> SnapshotResult<ChunkWorkerExit> {
        let handles = (0..self.config.max_chunk_workers)
            .map(|slot| {
                ChunkWorker::new(
                    WorkerId::new(&self.instance_id, slot),
                    job.clone(),
                    self.config.clone(),
                    self.source.clone(),
                    self.store.clone(),
                    self.destination.clone(),
                    self.shutdown_rx.clone(),
                )
                .start()
            })
            .collect::<Vec<_>>();

        info!(
            job_id = job.id,
            workers = handles.len(),
            "started chunk workers"
        );

        let mut exit = ChunkWorkerExit::Drained;
        let mut errors = Vec::new();
        for handle in handles {
            match handle.wait().await {
                Ok(worker_exit) => exit = exit.max(worker_exit),
                Err(err) => errors.push(err),
            }
        }

        if !errors.is_empty() {
            if errors.len() == 1 {
                return Err(errors.remove(0));
            }

            return Err(SnapshotError::from(errors));
        }

        debug!(job_id = job.id, ?exit, "chunk workers stopped");

        Ok(exit)
    }
}
