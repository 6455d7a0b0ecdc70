use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, warn};

use crate::store::base::MetadataStore;
use crate::types::{ChunkId, WorkerId};

/// Keeps a claim fresh while its chunk is being read.
///
/// The heartbeat task is aborted when the guard is dropped, so a worker that dies or gives up a
/// chunk stops heartbeating and its claim goes stale.
#[derive(Debug)]
pub struct HeartbeatGuard {
    handle: JoinHandle<()>,
    claim_lost: Arc<AtomicBool>,
}

impl HeartbeatGuard {
    /// Starts refreshing the claim of `worker_id` on `chunk_id` every `interval`.
    pub fn start<M>(store: M, chunk_id: ChunkId, worker_id: WorkerId, interval: Duration) -> Self
    where
        M: MetadataStore + Send + Sync + 'static,
    {
        let claim_lost = Arc::new(AtomicBool::new(false));

        let task = {
            let claim_lost = claim_lost.clone();
            async move {
                loop {
                    tokio::time::sleep(interval).await;

                    match store.heartbeat_chunk(chunk_id, &worker_id).await {
                        Ok(true) => debug!(chunk_id, "refreshed chunk claim"),
                        Ok(false) => {
                            warn!(chunk_id, %worker_id, "chunk claim was lost");
                            claim_lost.store(true, Ordering::SeqCst);
                            return;
                        }
                        // The next tick retries. If the store stays unreachable the claim goes
                        // stale and the chunk moves to another worker.
                        Err(err) => warn!(chunk_id, error = %err, "failed to refresh chunk claim"),
                    }
                }
            }
        }
        .instrument(tracing::Span::current());

        Self {
            handle: tokio::spawn(task),
            claim_lost,
        }
    }

    /// Returns `true` once a heartbeat found the claim taken away.
    pub fn claim_lost(&self) -> bool {
        self.claim_lost.load(Ordering::SeqCst)
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryMetadataStore;
    use crate::types::{ChunkBounds, ChunkPlan, PgLsn, TableName, ViewToken};

    async fn claimed_chunk(store: &MemoryMetadataStore, worker: &WorkerId) -> ChunkId {
        let job = store.create_job("slot", PgLsn::from(1)).await.unwrap();
        store
            .store_plan(
                job.id,
                vec![ChunkPlan {
                    table: TableName::new("public", "t"),
                    order_by: vec!["id".to_string()],
                    bounds: ChunkBounds::Range {
                        start: None,
                        end: None,
                    },
                }],
            )
            .await
            .unwrap();
        store
            .publish_view_token(job.id, &ViewToken::new("v"))
            .await
            .unwrap();

        store
            .claim_chunk(job.id, worker)
            .await
            .unwrap()
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn heartbeats_keep_the_claim_fresh() {
        let store = MemoryMetadataStore::new();
        let worker = WorkerId::from("a/0".to_string());
        let chunk_id = claimed_chunk(&store, &worker).await;
        let job_id = store.latest_job("slot").await.unwrap().unwrap().id;

        let guard = HeartbeatGuard::start(
            store.clone(),
            chunk_id,
            worker.clone(),
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(120)).await;

        let outcome = store
            .reclaim_stale_chunks(job_id, Duration::from_millis(60), 5)
            .await
            .unwrap();
        assert_eq!(outcome.reclaimed, 0);
        assert!(!guard.claim_lost());

        // Once the guard is gone the claim goes stale.
        drop(guard);
        tokio::time::sleep(Duration::from_millis(120)).await;
        let outcome = store
            .reclaim_stale_chunks(job_id, Duration::from_millis(60), 5)
            .await
            .unwrap();
        assert_eq!(outcome.reclaimed, 1);
    }

    #[tokio::test]
    async fn a_lost_claim_is_reported() {
        let store = MemoryMetadataStore::new();
        let worker = WorkerId::from("a/0".to_string());
        let chunk_id = claimed_chunk(&store, &worker).await;
        store.release_chunk(chunk_id, &worker).await.unwrap();

        let guard = HeartbeatGuard::start(store, chunk_id, worker, Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(guard.claim_lost());
    }
}
