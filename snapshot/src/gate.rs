//! Decides, once an instance has nothing left to claim, whether the snapshot is finished.

use chrono::Utc;
use snapshot_config::shared::SnapshotConfig;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::concurrency::shutdown::{ShutdownRx, is_shutdown_requested};
use crate::destination::Destination;
use crate::error::{ErrorKind, SnapshotResult};
use crate::snapshot_error;
use crate::source::base::ExportedView;
use crate::store::base::MetadataStore;
use crate::types::{Event, JobStatus, RunningJob, SnapshotEndEvent};
use crate::utils::retry::with_retry;

/// What the instance does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Every chunk completed and the job is closed. Streaming may start at the fence.
    Completed,
    /// Chunks became claimable again, the worker pool must run once more.
    Claimable,
    /// The job failed. A new cycle has to start.
    Failed,
    /// The view held by this instance died. The job has been marked failed.
    ViewLost,
    /// Shutdown was requested while waiting.
    Stopped,
}

/// Polls the progress of a running job until it completes, fails or needs more work.
#[derive(Debug)]
pub struct ContinuationGate<M, D> {
    config: Arc<SnapshotConfig>,
    store: M,
    destination: D,
    shutdown_rx: ShutdownRx,
    /// When this instance first saw every chunk completed while another instance held the view.
    done_since: Option<Instant>,
}

impl<M, D> ContinuationGate<M, D>
where
    M: MetadataStore + Sync,
    D: Destination + Sync,
{
    pub fn new(
        config: Arc<SnapshotConfig>,
        store: M,
        destination: D,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            config,
            store,
            destination,
            shutdown_rx,
            done_since: None,
        }
    }

    /// Waits for the next decision about `job`.
    ///
    /// `view` is the exported view when this instance holds it. The view is closed before the job
    /// is completed, so it is `None` afterwards.
    pub async fn wait<V>(
        &mut self,
        job: &RunningJob,
        view: &mut Option<V>,
    ) -> SnapshotResult<GateDecision>
    where
        V: ExportedView,
    {
        loop {
            if is_shutdown_requested(&self.shutdown_rx) {
                return Ok(GateDecision::Stopped);
            }

            if let Some(decision) = self.poll(job, view).await? {
                return Ok(decision);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                _ = self.shutdown_rx.changed() => return Ok(GateDecision::Stopped),
            }
        }
    }

    async fn poll<V>(
        &mut self,
        job: &RunningJob,
        view: &mut Option<V>,
    ) -> SnapshotResult<Option<GateDecision>>
    where
        V: ExportedView,
    {
        let outcome = with_retry(&self.config.store_retry, "reclaiming stale chunks", || {
            self.store.reclaim_stale_chunks(
                job.id,
                self.config.claim_timeout(),
                self.config.max_chunk_attempts,
            )
        })
        .await?;

        if outcome.reclaimed > 0 {
            info!(job_id = job.id, reclaimed = outcome.reclaimed, "reclaimed stale chunks");
        }

        let current = with_retry(&self.config.store_retry, "loading the job", || {
            self.store.get_job(job.id)
        })
        .await?;

        match current.map(|job| job.status) {
            Some(JobStatus::Running) => {}
            Some(JobStatus::Completed) => return Ok(Some(GateDecision::Completed)),
            status => {
                info!(job_id = job.id, ?status, "snapshot job is not running anymore");
                return Ok(Some(GateDecision::Failed));
            }
        }

        let progress = with_retry(&self.config.store_retry, "loading job progress", || {
            self.store.job_progress(job.id)
        })
        .await?;

        if outcome.exhausted > 0 || progress.failed > 0 {
            let err = snapshot_error!(
                ErrorKind::ChunkRetriesExhausted,
                "Chunks used up their attempts",
                format!("{} chunks of job {} failed", progress.failed, job.id)
            );
            warn!(job_id = job.id, error = %err, "failing snapshot job");
            self.store.fail_job(job.id, &err.to_string()).await?;

            return Ok(Some(GateDecision::Failed));
        }

        // Once every chunk is completed the view is not needed anymore, so a dead view no longer
        // matters.
        if progress.is_done() {
            if let Some(held) = view.take() {
                if let Err(err) = held.close().await {
                    warn!(job_id = job.id, error = %err, "failed to close the exported view");
                }

                return self.complete(job).await.map(Some);
            }

            // The instance holding the view should complete the job. If it does not within a
            // claim timeout it is presumed dead, and any instance may complete the job instead.
            let done_since = *self.done_since.get_or_insert_with(Instant::now);
            if done_since.elapsed() >= self.config.claim_timeout() {
                info!(
                    job_id = job.id,
                    "view holder did not complete the snapshot, completing it"
                );
                return self.complete(job).await.map(Some);
            }

            return Ok(None);
        }

        self.done_since = None;

        if let Some(held) = view.as_ref()
            && !held.is_alive()
        {
            let err = snapshot_error!(
                ErrorKind::ExportedViewLost,
                "The exported view was lost",
                format!("the session exporting view {} ended", held.token())
            );
            warn!(job_id = job.id, error = %err, "failing snapshot job");
            self.store.fail_job(job.id, &err.to_string()).await?;

            return Ok(Some(GateDecision::ViewLost));
        }

        if progress.has_claimable() {
            return Ok(Some(GateDecision::Claimable));
        }

        Ok(None)
    }

    /// Moves the job to completed. Only the instance whose conditional update applies emits
    /// [`Event::SnapshotEnd`].
    async fn complete(&mut self, job: &RunningJob) -> SnapshotResult<GateDecision> {
        let completed = self
            .store
            .transition_job(job.id, JobStatus::Running, JobStatus::Completed)
            .await?;

        if completed {
            self.destination
                .write_events(vec![Event::SnapshotEnd(SnapshotEndEvent {
                    job_id: job.id,
                    fence_lsn: job.fence_lsn,
                    time: Utc::now(),
                })])
                .await?;

            info!(job_id = job.id, fence_lsn = %job.fence_lsn, "snapshot completed");
            return Ok(GateDecision::Completed);
        }

        let status = self.store.get_job(job.id).await?.map(|job| job.status);
        if status == Some(JobStatus::Completed) {
            return Ok(GateDecision::Completed);
        }

        Ok(GateDecision::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::shutdown::create_shutdown_channel;
    use crate::destination::memory::MemoryDestination;
    use crate::exporter::ViewExporter;
    use crate::planner::SnapshotPlanner;
    use crate::source::base::SnapshotSource;
    use crate::source::memory::MemorySource;
    use crate::store::memory::MemoryMetadataStore;
    use crate::types::{ColumnSchema, EventType, TableName, TableSchema, WorkerId};
    use snapshot_config::shared::SnapshotMode;
    use std::time::Duration;
    use tokio_postgres::types::Type;

    type View = <MemorySource as SnapshotSource>::View;

    struct Fixture {
        config: Arc<SnapshotConfig>,
        source: MemorySource,
        store: MemoryMetadataStore,
        destination: MemoryDestination,
        job: RunningJob,
        view: Option<View>,
    }

    async fn fixture(rows: i64) -> Fixture {
        let table = TableName::new("public", "orders");
        let source = MemorySource::new();
        source.create_table(TableSchema::new(
            table.clone(),
            vec![ColumnSchema::new("id", Type::INT8, -1, false, true)],
        ));
        for id in 1..=rows {
            source.insert(&table, vec![Some(id.to_string())]).unwrap();
        }

        let mut config = SnapshotConfig::new(
            "orders_slot",
            SnapshotMode::SnapshotOnly,
            vec!["public.orders".to_string()],
        );
        config.chunk_size = 10;
        config.claim_timeout_ms = 100;
        config.heartbeat_interval_ms = 20;
        config.poll_interval_ms = 10;
        let config = Arc::new(config);

        let store = MemoryMetadataStore::new();
        let destination = MemoryDestination::new();
        let mut job = SnapshotPlanner::new(config.clone(), source.clone(), store.clone())
            .plan()
            .await
            .unwrap();
        let view = ViewExporter::new(source.clone(), store.clone(), destination.clone())
            .export(&mut job)
            .await
            .unwrap();

        Fixture {
            config,
            source,
            store,
            destination,
            job: job.running_view().unwrap(),
            view: Some(view),
        }
    }

    async fn complete_all_chunks(fixture: &Fixture) {
        let worker = WorkerId::from("a/0".to_string());
        while let Some(chunk) = fixture
            .store
            .claim_chunk(fixture.job.id, &worker)
            .await
            .unwrap()
        {
            fixture.store.complete_chunk(chunk.id, &worker).await.unwrap();
        }
    }

    fn gate(
        fixture: &Fixture,
        shutdown_rx: ShutdownRx,
    ) -> ContinuationGate<MemoryMetadataStore, MemoryDestination> {
        ContinuationGate::new(
            fixture.config.clone(),
            fixture.store.clone(),
            fixture.destination.clone(),
            shutdown_rx,
        )
    }

    #[tokio::test]
    async fn view_holder_completes_the_job() {
        let mut fixture = fixture(30).await;
        complete_all_chunks(&fixture).await;
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();

        let decision = gate(&fixture, shutdown_rx)
            .wait(&fixture.job, &mut fixture.view)
            .await
            .unwrap();

        assert_eq!(decision, GateDecision::Completed);
        assert!(fixture.view.is_none());
        assert_eq!(fixture.source.exported_view_count(), 0);

        let job = fixture.store.get_job(fixture.job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(
            fixture
                .destination
                .events_of_type(EventType::SnapshotEnd)
                .await
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn stale_claims_make_chunks_claimable() {
        let mut fixture = fixture(30).await;
        let worker = WorkerId::from("dead/0".to_string());
        fixture
            .store
            .claim_chunk(fixture.job.id, &worker)
            .await
            .unwrap()
            .unwrap();
        // Leave one claimed chunk and complete nothing else, so no chunk is pending right now.
        let other = WorkerId::from("b/0".to_string());
        while let Some(chunk) = fixture.store.claim_chunk(fixture.job.id, &other).await.unwrap() {
            fixture.store.complete_chunk(chunk.id, &other).await.unwrap();
        }
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();

        let decision = gate(&fixture, shutdown_rx)
            .wait(&fixture.job, &mut fixture.view)
            .await
            .unwrap();

        assert_eq!(decision, GateDecision::Claimable);
        assert!(fixture.view.is_some());
    }

    #[tokio::test]
    async fn dead_view_fails_the_job() {
        let mut fixture = fixture(30).await;
        fixture.source.kill_exported_views();
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();

        let decision = gate(&fixture, shutdown_rx)
            .wait(&fixture.job, &mut fixture.view)
            .await
            .unwrap();

        assert_eq!(decision, GateDecision::ViewLost);
        let job = fixture.store.get_job(fixture.job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn dead_view_after_the_last_chunk_still_completes() {
        let mut fixture = fixture(30).await;
        complete_all_chunks(&fixture).await;
        fixture.source.kill_exported_views();
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();

        let decision = gate(&fixture, shutdown_rx)
            .wait(&fixture.job, &mut fixture.view)
            .await
            .unwrap();

        assert_eq!(decision, GateDecision::Completed);
        assert!(fixture.view.is_none());
        let job = fixture.store.get_job(fixture.job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(fixture.store.job_chunks(job.id).await.unwrap().len(), 3);
        assert_eq!(
            fixture
                .destination
                .events_of_type(EventType::SnapshotEnd)
                .await
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn another_instance_completes_after_the_holder_vanished() {
        let fixture = fixture(30).await;
        complete_all_chunks(&fixture).await;

        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let mut first = gate(&fixture, shutdown_rx.clone());
        let mut second = gate(&fixture, shutdown_rx);

        let mut no_view: Option<View> = None;
        let mut no_view_either: Option<View> = None;
        let (a, b) = tokio::join!(
            first.wait(&fixture.job, &mut no_view),
            second.wait(&fixture.job, &mut no_view_either)
        );

        assert_eq!(a.unwrap(), GateDecision::Completed);
        assert_eq!(b.unwrap(), GateDecision::Completed);
        assert_eq!(
            fixture
                .destination
                .events_of_type(EventType::SnapshotEnd)
                .await
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn shutdown_stops_the_wait() {
        let mut fixture = fixture(30).await;
        // Every chunk is claimed and none goes stale before shutdown.
        let worker = WorkerId::from("a/0".to_string());
        while fixture
            .store
            .claim_chunk(fixture.job.id, &worker)
            .await
            .unwrap()
            .is_some()
        {}
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let mut gate = gate(&fixture, shutdown_rx);

        let stop = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            shutdown_tx.shutdown().unwrap();
        };
        let (decision, _) = tokio::join!(gate.wait(&fixture.job, &mut fixture.view), stop);

        assert_eq!(decision.unwrap(), GateDecision::Stopped);
    }
}
