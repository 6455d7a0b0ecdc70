//! Export of the consistent view every chunk is read from.

use chrono::Utc;
use tracing::{info, warn};

use crate::bail;
use crate::destination::Destination;
use crate::error::{ErrorKind, SnapshotResult};
use crate::source::base::{ExportedView, SnapshotSource};
use crate::store::base::MetadataStore;
use crate::types::{Event, JobStatus, SnapshotBeginEvent, SnapshotJob};

/// Exports the view of a job and makes it available to every instance.
#[derive(Debug)]
pub struct ViewExporter<S, M, D> {
    source: S,
    store: M,
    destination: D,
}

impl<S, M, D> ViewExporter<S, M, D>
where
    S: SnapshotSource,
    M: MetadataStore + Sync,
    D: Destination + Sync,
{
    pub fn new(source: S, store: M, destination: D) -> Self {
        Self {
            source,
            store,
            destination,
        }
    }

    /// Exports the view, publishes its token and moves the job to [`JobStatus::Running`].
    ///
    /// Returns the exported view, which the caller must keep alive until every chunk is read.
    /// Emits [`Event::SnapshotBegin`] once the job runs.
    pub async fn export(&self, job: &mut SnapshotJob) -> SnapshotResult<S::View> {
        let view = self.source.export_view().await?;

        if !self.store.publish_view_token(job.id, view.token()).await? {
            warn!(job_id = job.id, "job left the exporting status before the view was published");
            bail!(
                ErrorKind::InvalidJobTransition,
                "The job is not exporting anymore",
                format!("cannot publish the view of job {}", job.id)
            );
        }

        job.status = JobStatus::Running;
        job.view_token = Some(view.token().clone());

        info!(job_id = job.id, token = %view.token(), "published exported view");

        self.destination
            .write_events(vec![Event::SnapshotBegin(SnapshotBeginEvent {
                job_id: job.id,
                fence_lsn: job.fence_lsn,
                time: Utc::now(),
            })])
            .await?;

        Ok(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::memory::MemoryDestination;
    use crate::source::memory::MemorySource;
    use crate::store::memory::MemoryMetadataStore;
    use crate::types::{EventType, PgLsn};

    #[tokio::test]
    async fn export_runs_the_job_and_opens_the_snapshot() {
        let source = MemorySource::new();
        let store = MemoryMetadataStore::new();
        let destination = MemoryDestination::new();
        let mut job = store.create_job("slot", PgLsn::from(9)).await.unwrap();
        store.store_plan(job.id, vec![]).await.unwrap();

        let exporter = ViewExporter::new(source.clone(), store.clone(), destination.clone());
        let view = exporter.export(&mut job).await.unwrap();

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(stored.view_token.as_ref(), Some(view.token()));
        assert_eq!(job.status, stored.status);

        let begins = destination.events_of_type(EventType::SnapshotBegin).await;
        assert_eq!(begins.len(), 1);
        assert_eq!(source.exported_view_count(), 1);
    }

    #[tokio::test]
    async fn export_requires_an_exporting_job() {
        let store = MemoryMetadataStore::new();
        let destination = MemoryDestination::new();
        let mut job = store.create_job("slot", PgLsn::from(9)).await.unwrap();

        let exporter = ViewExporter::new(MemorySource::new(), store, destination.clone());
        let err = exporter.export(&mut job).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidJobTransition);
        assert!(destination.events().await.is_empty());
    }
}
