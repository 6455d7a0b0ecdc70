#![cfg(feature = "test-utils")]

use snapshot::error::ErrorKind;
use snapshot::store::base::MetadataStore;
use snapshot::test_utils::database::spawn_source_database_with_store;
use snapshot::types::{
    ChunkBounds, ChunkPlan, ChunkStatus, InstanceId, JobStatus, TableName, ViewToken, WorkerId,
};
use snapshot_telemetry::init_test_tracing;
use std::collections::HashSet;
use std::time::Duration;
use tokio_postgres::types::PgLsn;

fn plan(count: i64) -> Vec<ChunkPlan> {
    let table = TableName::new("public", "orders");

    (0..count)
        .map(|i| ChunkPlan {
            table: table.clone(),
            order_by: vec!["id".to_string()],
            bounds: ChunkBounds::Range {
                start: (i > 0).then_some(i * 100),
                end: (i + 1 < count).then_some((i + 1) * 100),
            },
        })
        .collect()
}

fn worker(name: &str) -> WorkerId {
    WorkerId::new(&InstanceId::from(name), 0)
}

#[tokio::test(flavor = "multi_thread")]
async fn job_lifecycle_follows_its_transitions() {
    init_test_tracing();
    let (_database, store) = spawn_source_database_with_store().await;

    assert!(store.latest_job("slot").await.unwrap().is_none());

    let job = store
        .create_job("slot", PgLsn::from(0x16_B374_D848))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Planning);

    // Only one live job per endpoint.
    let err = store.create_job("slot", PgLsn::from(1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LiveJobExists);
    store.create_job("other_slot", PgLsn::from(1)).await.unwrap();

    // Exporting requires a stored plan first.
    assert!(
        !store
            .publish_view_token(job.id, &ViewToken::new("00000003-00000002-1"))
            .await
            .unwrap()
    );

    assert_eq!(store.store_plan(job.id, plan(3)).await.unwrap(), 3);
    let err = store.store_plan(job.id, plan(3)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidJobTransition);
    assert_eq!(store.job_chunks(job.id).await.unwrap().len(), 3);

    assert!(
        store
            .publish_view_token(job.id, &ViewToken::new("00000003-00000002-1"))
            .await
            .unwrap()
    );
    let running = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(running.status, JobStatus::Running);
    assert_eq!(running.fence_lsn, PgLsn::from(0x16_B374_D848));
    assert_eq!(
        running.view_token,
        Some(ViewToken::new("00000003-00000002-1"))
    );

    assert!(
        !store
            .transition_job(job.id, JobStatus::Planning, JobStatus::Exporting)
            .await
            .unwrap()
    );
    assert!(
        store
            .transition_job(job.id, JobStatus::Running, JobStatus::Completed)
            .await
            .unwrap()
    );
    assert!(!store.fail_job(job.id, "too late").await.unwrap());

    // A terminal job lets the endpoint start over.
    let next = store.create_job("slot", PgLsn::from(2)).await.unwrap();
    assert_eq!(store.latest_job("slot").await.unwrap().unwrap().id, next.id);
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_a_job_discards_its_chunks() {
    init_test_tracing();
    let (_database, store) = spawn_source_database_with_store().await;

    let job = store.create_job("slot", PgLsn::from(1)).await.unwrap();
    store.store_plan(job.id, plan(4)).await.unwrap();

    assert!(store.fail_job(job.id, "exported view lost").await.unwrap());

    let failed = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.failure_reason.as_deref(), Some("exported view lost"));
    assert!(store.job_chunks(job.id).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_claims_are_exclusive() {
    init_test_tracing();
    let (_database, store) = spawn_source_database_with_store().await;

    let job = store.create_job("slot", PgLsn::from(1)).await.unwrap();
    store.store_plan(job.id, plan(40)).await.unwrap();
    store
        .publish_view_token(job.id, &ViewToken::new("token"))
        .await
        .unwrap();

    let tasks = (0..8)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                let worker = worker(&format!("node-{i}"));
                let mut claimed = Vec::new();
                while let Some(chunk) = store.claim_chunk(job.id, &worker).await.unwrap() {
                    assert_eq!(chunk.claimed_by.as_ref(), Some(&worker));
                    claimed.push(chunk.id);
                }
                claimed
            })
        })
        .collect::<Vec<_>>();

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }

    assert_eq!(all.len(), 40);
    assert_eq!(all.iter().collect::<HashSet<_>>().len(), 40);

    let progress = store.job_progress(job.id).await.unwrap();
    assert_eq!(progress.in_progress, 40);
    assert_eq!(progress.pending, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn chunk_mutations_require_the_claim() {
    init_test_tracing();
    let (_database, store) = spawn_source_database_with_store().await;

    let job = store.create_job("slot", PgLsn::from(1)).await.unwrap();
    store.store_plan(job.id, plan(2)).await.unwrap();

    // Nothing is claimable before the view is published.
    let owner = worker("a");
    assert!(store.claim_chunk(job.id, &owner).await.unwrap().is_none());
    store
        .publish_view_token(job.id, &ViewToken::new("token"))
        .await
        .unwrap();

    let chunk = store.claim_chunk(job.id, &owner).await.unwrap().unwrap();
    assert_eq!(chunk.attempts, 1);
    assert_eq!(chunk.status, ChunkStatus::InProgress);

    let intruder = worker("b");
    assert!(!store.heartbeat_chunk(chunk.id, &intruder).await.unwrap());
    assert!(!store.complete_chunk(chunk.id, &intruder).await.unwrap());
    assert!(
        !store
            .record_chunk_error(chunk.id, &intruder, "boom")
            .await
            .unwrap()
    );

    assert!(store.heartbeat_chunk(chunk.id, &owner).await.unwrap());
    assert!(
        store
            .record_chunk_error(chunk.id, &owner, "read timed out")
            .await
            .unwrap()
    );
    assert!(store.release_chunk(chunk.id, &owner).await.unwrap());
    assert!(!store.complete_chunk(chunk.id, &owner).await.unwrap());

    let chunks = store.job_chunks(job.id).await.unwrap();
    let released = chunks.iter().find(|c| c.id == chunk.id).unwrap();
    assert_eq!(released.status, ChunkStatus::Pending);
    assert_eq!(released.claimed_by, None);
    assert_eq!(released.last_error.as_deref(), Some("read timed out"));

    let again = store.claim_chunk(job.id, &owner).await.unwrap().unwrap();
    assert!(store.complete_chunk(again.id, &owner).await.unwrap());
    let progress = store.job_progress(job.id).await.unwrap();
    assert_eq!(progress.completed, 1);
    assert_eq!(progress.pending, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_claims_are_reclaimed_until_attempts_run_out() {
    init_test_tracing();
    let (_database, store) = spawn_source_database_with_store().await;

    let job = store.create_job("slot", PgLsn::from(1)).await.unwrap();
    store.store_plan(job.id, plan(1)).await.unwrap();
    store
        .publish_view_token(job.id, &ViewToken::new("token"))
        .await
        .unwrap();

    let timeout = Duration::from_millis(200);
    let first = store.claim_chunk(job.id, &worker("a")).await.unwrap().unwrap();

    // A fresh claim is left alone.
    let outcome = store.reclaim_stale_chunks(job.id, timeout, 2).await.unwrap();
    assert_eq!(outcome.reclaimed, 0);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let outcome = store.reclaim_stale_chunks(job.id, timeout, 2).await.unwrap();
    assert_eq!(outcome.reclaimed, 1);
    assert_eq!(outcome.exhausted, 0);
    assert!(!store.heartbeat_chunk(first.id, &worker("a")).await.unwrap());

    let second = store.claim_chunk(job.id, &worker("b")).await.unwrap().unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.attempts, 2);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let outcome = store.reclaim_stale_chunks(job.id, timeout, 2).await.unwrap();
    assert_eq!(outcome.exhausted, 1);

    let progress = store.job_progress(job.id).await.unwrap();
    assert_eq!(progress.failed, 1);
    assert!(!progress.has_claimable());
}
