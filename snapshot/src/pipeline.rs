//! Orchestration of the parallel initial snapshot.
//!
//! Contains the [`SnapshotPipeline`] every instance runs. Instances configured with the same
//! endpoint cooperate on one snapshot job: one of them is elected coordinator and plans and
//! exports the job, and all of them read its chunks until the job completes.

use snapshot_config::shared::SnapshotConfig;
use std::sync::Arc;
use tokio_postgres::types::PgLsn;
use tracing::{error, info, warn};

use crate::bail;
use crate::concurrency::shutdown::{
    ShutdownRx, ShutdownTx, create_shutdown_channel, is_shutdown_requested,
};
use crate::destination::Destination;
use crate::election::{CoordinatorElector, Election};
use crate::error::{ErrorKind, SnapshotResult};
use crate::exporter::ViewExporter;
use crate::gate::{ContinuationGate, GateDecision};
use crate::planner::SnapshotPlanner;
use crate::recovery::{RecoveryAction, recover};
use crate::source::base::SnapshotSource;
use crate::store::base::MetadataStore;
use crate::streaming::StreamingLayer;
use crate::types::{InstanceId, JobId, JobStatus, RunningJob, SnapshotJob};
use crate::workers::chunk::ChunkWorkerExit;
use crate::workers::pool::ChunkWorkerPool;

/// Part an instance played in the job it finished with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotRole {
    Coordinator,
    Worker,
}

/// Result of [`SnapshotPipeline::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// The configured mode skips the snapshot.
    Skipped,
    /// The snapshot job completed. Streaming resumes at `fence_lsn`.
    Completed {
        job_id: JobId,
        fence_lsn: PgLsn,
        role: SnapshotRole,
        /// Whether streaming should start once the snapshot is done.
        continue_streaming: bool,
    },
    /// Shutdown was requested before the snapshot completed.
    Stopped,
}

impl SnapshotOutcome {
    pub fn fence_lsn(&self) -> Option<PgLsn> {
        match self {
            SnapshotOutcome::Completed { fence_lsn, .. } => Some(*fence_lsn),
            SnapshotOutcome::Skipped | SnapshotOutcome::Stopped => None,
        }
    }

    /// Starts `streaming` at the fence when the snapshot completed and the mode streams
    /// afterwards. Returns whether streaming was started.
    pub async fn hand_off<L>(&self, streaming: &L) -> SnapshotResult<bool>
    where
        L: StreamingLayer + Sync,
    {
        let SnapshotOutcome::Completed {
            fence_lsn,
            continue_streaming: true,
            ..
        } = self
        else {
            return Ok(false);
        };

        info!(%fence_lsn, "handing off to streaming");
        streaming.start_at(*fence_lsn).await?;

        Ok(true)
    }
}

/// How one snapshot cycle ended.
#[derive(Debug)]
enum CycleOutcome {
    Completed {
        job_id: JobId,
        fence_lsn: PgLsn,
        role: SnapshotRole,
    },
    /// The job failed. Counts against `max_job_attempts`.
    Failed,
    /// There is no running job to join yet.
    Retry,
    Stopped,
}

impl CycleOutcome {
    fn completed(job: &SnapshotJob, role: SnapshotRole) -> Self {
        CycleOutcome::Completed {
            job_id: job.id,
            fence_lsn: job.fence_lsn,
            role,
        }
    }
}

/// The snapshot process of one instance.
#[derive(Debug)]
pub struct SnapshotPipeline<S, M, D> {
    instance_id: InstanceId,
    config: Arc<SnapshotConfig>,
    source: S,
    store: M,
    destination: D,
    shutdown_tx: ShutdownTx,
    shutdown_rx: ShutdownRx,
}

impl<S, M, D> SnapshotPipeline<S, M, D>
where
    S: SnapshotSource,
    M: MetadataStore + Clone + Send + Sync + 'static,
    D: Destination + Clone + Send + Sync + 'static,
{
    pub fn new(
        instance_id: InstanceId,
        config: SnapshotConfig,
        source: S,
        store: M,
        destination: D,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();

        Self {
            instance_id,
            config: Arc::new(config),
            source,
            store,
            destination,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Returns a sender that stops the pipeline and all its chunk workers.
    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    /// Takes part in the snapshot of the configured endpoint until it completes.
    ///
    /// Failed jobs are retried with a fresh plan up to `max_job_attempts` times, after which
    /// [`ErrorKind::JobFailed`] is returned. Planning failures are returned right away.
    pub async fn run(&self) -> SnapshotResult<SnapshotOutcome> {
        if let Err(err) = self.config.validate() {
            bail!(
                ErrorKind::ValidationError,
                "Invalid snapshot configuration",
                err
            );
        }

        if !self.config.mode.takes_snapshot() {
            info!(endpoint = %self.config.endpoint, "initial snapshot disabled, skipping it");
            return Ok(SnapshotOutcome::Skipped);
        }

        info!(
            endpoint = %self.config.endpoint,
            instance_id = %self.instance_id,
            "starting initial snapshot"
        );

        let elector = CoordinatorElector::new(self.source.clone());
        let mut failed_cycles = 0;

        loop {
            if is_shutdown_requested(&self.shutdown_rx) {
                return Ok(SnapshotOutcome::Stopped);
            }

            let cycle = match elector.try_elect(&self.config.endpoint).await? {
                Election::Coordinator(lease) => {
                    // The lease is held for the whole cycle, so no other instance plans or
                    // cleans up while this one coordinates.
                    let cycle = self.coordinate().await;
                    drop(lease);
                    cycle?
                }
                Election::Worker => self.assist().await?,
            };

            match cycle {
                CycleOutcome::Completed {
                    job_id,
                    fence_lsn,
                    role,
                } => {
                    info!(job_id, %fence_lsn, ?role, "initial snapshot finished");

                    return Ok(SnapshotOutcome::Completed {
                        job_id,
                        fence_lsn,
                        role,
                        continue_streaming: self.config.mode.streams_after_snapshot(),
                    });
                }
                CycleOutcome::Stopped => return Ok(SnapshotOutcome::Stopped),
                CycleOutcome::Failed => {
                    failed_cycles += 1;
                    if failed_cycles >= self.config.max_job_attempts {
                        error!(failed_cycles, "giving up on the initial snapshot");
                        bail!(
                            ErrorKind::JobFailed,
                            "The initial snapshot failed too many times",
                            format!(
                                "{failed_cycles} snapshot jobs of endpoint '{}' failed",
                                self.config.endpoint
                            )
                        );
                    }

                    warn!(failed_cycles, "snapshot job failed, starting a new cycle");
                }
                CycleOutcome::Retry => {
                    let mut shutdown_rx = self.shutdown_rx.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval()) => {}
                        _ = shutdown_rx.changed() => return Ok(SnapshotOutcome::Stopped),
                    }
                }
            }
        }
    }

    /// Runs a cycle as the elected coordinator.
    async fn coordinate(&self) -> SnapshotResult<CycleOutcome> {
        match recover(&self.store, &self.config.endpoint).await? {
            RecoveryAction::AlreadyCompleted(job) => {
                return Ok(CycleOutcome::completed(&job, SnapshotRole::Coordinator));
            }
            RecoveryAction::Join(job) => {
                return self.join(&job, SnapshotRole::Coordinator).await;
            }
            RecoveryAction::Plan => {}
        }

        let planner =
            SnapshotPlanner::new(self.config.clone(), self.source.clone(), self.store.clone());
        let mut job = match planner.plan().await {
            Ok(job) => job,
            Err(err) if err.kind() == ErrorKind::LiveJobExists => {
                info!("another instance planned the job first, joining it");
                return self.assist().await;
            }
            Err(err) => return Err(err),
        };

        let exporter = ViewExporter::new(
            self.source.clone(),
            self.store.clone(),
            self.destination.clone(),
        );
        let view = match exporter.export(&mut job).await {
            Ok(view) => view,
            Err(err) => {
                warn!(job_id = job.id, error = %err, "failed to export the snapshot view");
                self.store.fail_job(job.id, &err.to_string()).await?;

                return Ok(CycleOutcome::Failed);
            }
        };

        let Some(running) = job.running_view() else {
            bail!(
                ErrorKind::InvalidState,
                "Exported job is not running",
                format!("job {} is {}", job.id, job.status)
            );
        };

        self.work(running, Some(view), SnapshotRole::Coordinator)
            .await
    }

    /// Runs a cycle as a worker of the job another instance coordinates.
    async fn assist(&self) -> SnapshotResult<CycleOutcome> {
        let Some(job) = self.store.latest_job(&self.config.endpoint).await? else {
            return Ok(CycleOutcome::Retry);
        };

        match job.status {
            JobStatus::Completed => Ok(CycleOutcome::completed(&job, SnapshotRole::Worker)),
            JobStatus::Running => self.join(&job, SnapshotRole::Worker).await,
            JobStatus::Planning | JobStatus::Exporting => self.await_publication(job.id).await,
            // A failed job is replaced by the next coordinator.
            JobStatus::Failed => Ok(CycleOutcome::Retry),
        }
    }

    /// Watches a job the coordinator is still planning or exporting until its view is
    /// published.
    ///
    /// Gives up after one claim timeout without the job moving on, so that a coordinator that
    /// died while planning is replaced through a new election.
    async fn await_publication(&self, job_id: JobId) -> SnapshotResult<CycleOutcome> {
        info!(job_id, "waiting for the coordinator to publish the snapshot view");

        let deadline = tokio::time::Instant::now() + self.config.claim_timeout();
        let mut shutdown_rx = self.shutdown_rx.clone();

        while tokio::time::Instant::now() < deadline {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                _ = shutdown_rx.changed() => return Ok(CycleOutcome::Stopped),
            }

            let Some(job) = self.store.get_job(job_id).await? else {
                return Ok(CycleOutcome::Retry);
            };
            match job.status {
                JobStatus::Planning | JobStatus::Exporting => {}
                JobStatus::Running => return self.join(&job, SnapshotRole::Worker).await,
                JobStatus::Completed => {
                    return Ok(CycleOutcome::completed(&job, SnapshotRole::Worker));
                }
                JobStatus::Failed => return Ok(CycleOutcome::Retry),
            }
        }

        warn!(job_id, "snapshot job was not published in time, electing again");

        Ok(CycleOutcome::Retry)
    }

    async fn join(&self, job: &SnapshotJob, role: SnapshotRole) -> SnapshotResult<CycleOutcome> {
        let Some(running) = job.running_view() else {
            bail!(
                ErrorKind::InvalidState,
                "Running job has no exported view",
                format!("job {} has no view token", job.id)
            );
        };

        info!(job_id = job.id, ?role, "joining running snapshot job");

        self.work(running, None::<S::View>, role).await
    }

    /// Reads chunks until the job completes, alternating between the worker pool and the
    /// continuation gate.
    async fn work(
        &self,
        job: RunningJob,
        mut view: Option<S::View>,
        role: SnapshotRole,
    ) -> SnapshotResult<CycleOutcome> {
        let pool = ChunkWorkerPool::new(
            self.instance_id.clone(),
            self.config.clone(),
            self.source.clone(),
            self.store.clone(),
            self.destination.clone(),
            self.shutdown_rx.clone(),
        );
        let mut gate = ContinuationGate::new(
            self.config.clone(),
            self.store.clone(),
            self.destination.clone(),
            self.shutdown_rx.clone(),
        );

        loop {
            match pool.run(&job).await? {
                ChunkWorkerExit::Shutdown => return Ok(CycleOutcome::Stopped),
                ChunkWorkerExit::ViewLost => return Ok(CycleOutcome::Failed),
                ChunkWorkerExit::Drained | ChunkWorkerExit::JobClosed => {}
            }

            match gate.wait(&job, &mut view).await? {
                GateDecision::Completed => {
                    return Ok(CycleOutcome::Completed {
                        job_id: job.id,
                        fence_lsn: job.fence_lsn,
                        role,
                    });
                }
                GateDecision::Claimable => continue,
                GateDecision::Failed | GateDecision::ViewLost => return Ok(CycleOutcome::Failed),
                GateDecision::Stopped => return Ok(CycleOutcome::Stopped),
            }
        }
    }
}
