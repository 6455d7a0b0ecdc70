//! What a newly elected coordinator does with the job left behind by its predecessors.

use tracing::{info, warn};

use crate::error::{ErrorKind, SnapshotResult};
use crate::snapshot_error;
use crate::store::base::MetadataStore;
use crate::types::{JobStatus, SnapshotJob};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Plan a new job.
    Plan,
    /// The latest job is running. Join it as a chunk worker.
    Join(SnapshotJob),
    /// The latest job completed, there is nothing left to snapshot.
    AlreadyCompleted(SnapshotJob),
}

/// Inspects the latest job of `endpoint` and cleans up after a dead coordinator.
///
/// Must only be called while holding the coordinator lease: a job found in planning or exporting
/// then belongs to a coordinator that is gone, so it is failed and its chunks discarded.
pub async fn recover<M>(store: &M, endpoint: &str) -> SnapshotResult<RecoveryAction>
where
    M: MetadataStore,
{
    let Some(job) = store.latest_job(endpoint).await? else {
        info!(endpoint, "no previous snapshot job, planning a new one");
        return Ok(RecoveryAction::Plan);
    };

    let action = match job.status {
        JobStatus::Planning | JobStatus::Exporting => {
            let err = snapshot_error!(
                ErrorKind::InvalidState,
                "The coordinator of the job vanished",
                format!("job {} was abandoned while {}", job.id, job.status)
            );
            warn!(job_id = job.id, status = %job.status, "failing abandoned snapshot job");
            store.fail_job(job.id, &err.to_string()).await?;

            RecoveryAction::Plan
        }
        JobStatus::Running => RecoveryAction::Join(job),
        JobStatus::Completed => RecoveryAction::AlreadyCompleted(job),
        JobStatus::Failed => RecoveryAction::Plan,
    };

    info!(endpoint, ?action, "recovered snapshot state");

    Ok(action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryMetadataStore;
    use crate::types::{ChunkBounds, ChunkPlan, PgLsn, TableName, ViewToken};

    fn plan() -> Vec<ChunkPlan> {
        vec![ChunkPlan {
            table: TableName::new("public", "t"),
            order_by: vec!["id".to_string()],
            bounds: ChunkBounds::Range {
                start: None,
                end: None,
            },
        }]
    }

    #[tokio::test]
    async fn nothing_to_recover_plans() {
        let store = MemoryMetadataStore::new();

        assert_eq!(recover(&store, "slot").await.unwrap(), RecoveryAction::Plan);
    }

    #[tokio::test]
    async fn abandoned_jobs_are_failed_and_replanned() {
        let store = MemoryMetadataStore::new();
        let job = store.create_job("slot", PgLsn::from(10)).await.unwrap();
        store.store_plan(job.id, plan()).await.unwrap();

        assert_eq!(recover(&store, "slot").await.unwrap(), RecoveryAction::Plan);

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(store.job_chunks(job.id).await.unwrap().is_empty());
        // The failed job no longer blocks a new one.
        store.create_job("slot", PgLsn::from(20)).await.unwrap();
    }

    #[tokio::test]
    async fn running_jobs_are_joined_and_completed_jobs_kept() {
        let store = MemoryMetadataStore::new();
        let job = store.create_job("slot", PgLsn::from(10)).await.unwrap();
        store.store_plan(job.id, plan()).await.unwrap();
        store
            .publish_view_token(job.id, &ViewToken::new("0000000A-00000001-1"))
            .await
            .unwrap();

        let RecoveryAction::Join(joined) = recover(&store, "slot").await.unwrap() else {
            panic!("expected to join the running job");
        };
        assert_eq!(joined.id, job.id);

        store
            .transition_job(job.id, JobStatus::Running, JobStatus::Completed)
            .await
            .unwrap();
        let RecoveryAction::AlreadyCompleted(completed) = recover(&store, "slot").await.unwrap()
        else {
            panic!("expected the completed job");
        };
        assert_eq!(completed.fence_lsn, PgLsn::from(10));
    }
}
