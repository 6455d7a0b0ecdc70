use crate::migrations::migrate_metadata_store;
use snapshot::destination::stdout::StdoutDestination;
use snapshot::error::SnapshotResult;
use snapshot::pipeline::{SnapshotOutcome, SnapshotPipeline};
use snapshot::source::postgres::PgSnapshotSource;
use snapshot::store::postgres::PostgresMetadataStore;
use snapshot::streaming::StreamingLayer;
use snapshot::types::{InstanceId, PgLsn};
use snapshot_config::shared::{PgConnectionConfig, ReplicatorConfig, SnapshotConfig};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, warn};

/// Connections of the metadata store pool on top of one per chunk worker, used by the
/// reclaimer, heartbeats and the continuation gate.
const EXTRA_STORE_CONNECTIONS: u32 = 4;

/// Streaming layer of the replicator binary.
///
/// The change stream transport runs outside of this process, so the hand-off only records the
/// position it has to resume from.
#[derive(Debug, Clone, Copy)]
struct LoggedStreaming;

impl StreamingLayer for LoggedStreaming {
    async fn start_at(&self, fence_lsn: PgLsn) -> SnapshotResult<()> {
        info!(%fence_lsn, "change streaming resumes at the snapshot fence");

        Ok(())
    }
}

/// Starts the replicator service with the provided configuration.
///
/// Applies the metadata store migrations, takes part in the snapshot of the configured endpoint
/// and hands the fence over to streaming once it completed.
pub async fn start_replicator_with_config(
    replicator_config: ReplicatorConfig,
) -> anyhow::Result<()> {
    info!("starting snapshot replicator");

    log_config(&replicator_config);

    migrate_metadata_store(&replicator_config.source).await?;

    let max_connections =
        u32::from(replicator_config.snapshot.max_chunk_workers) + EXTRA_STORE_CONNECTIONS;
    let store = PostgresMetadataStore::connect(&replicator_config.source, max_connections).await?;
    let source = PgSnapshotSource::new(replicator_config.source.clone());
    let destination = StdoutDestination::new();

    let pipeline = SnapshotPipeline::new(
        InstanceId::generate(),
        replicator_config.snapshot,
        source,
        store,
        destination,
    );

    let outcome = run_pipeline(&pipeline).await?;
    match &outcome {
        SnapshotOutcome::Skipped => info!("snapshot skipped by configuration"),
        SnapshotOutcome::Completed {
            job_id,
            fence_lsn,
            role,
            ..
        } => info!(job_id, %fence_lsn, ?role, "snapshot completed"),
        SnapshotOutcome::Stopped => {
            info!("snapshot stopped before completion");
            return Ok(());
        }
    }

    if !outcome.hand_off(&LoggedStreaming).await? {
        info!("streaming is not started after the snapshot");
    }

    info!("snapshot replicator completed");

    Ok(())
}

fn log_config(config: &ReplicatorConfig) {
    log_pg_connection_config(&config.source);
    log_snapshot_config(&config.snapshot);
}

fn log_pg_connection_config(config: &PgConnectionConfig) {
    debug!(
        host = config.host,
        port = config.port,
        dbname = config.name,
        username = config.username,
        tls_enabled = config.tls.enabled,
        "source postgres connection config",
    );
}

fn log_snapshot_config(config: &SnapshotConfig) {
    debug!(
        endpoint = config.endpoint,
        mode = ?config.mode,
        tables = ?config.tables,
        chunk_size = config.chunk_size,
        claim_timeout_ms = config.claim_timeout_ms,
        heartbeat_interval_ms = config.heartbeat_interval_ms,
        max_chunk_workers = config.max_chunk_workers,
        max_job_attempts = config.max_job_attempts,
        "snapshot config"
    );
}

/// Runs the pipeline until it finishes or a shutdown signal arrives.
///
/// SIGTERM and SIGINT stop the pipeline gracefully: in-flight chunks are rolled back and released
/// so other instances can pick them up right away.
#[tracing::instrument(skip(pipeline), fields(instance_id = %pipeline.instance_id()))]
async fn run_pipeline(
    pipeline: &SnapshotPipeline<PgSnapshotSource, PostgresMetadataStore, StdoutDestination>,
) -> anyhow::Result<SnapshotOutcome> {
    // Sent by Kubernetes before SIGKILL during pod termination.
    let mut sigterm = signal(SignalKind::terminate())?;

    let shutdown_tx = pipeline.shutdown_tx();
    let shutdown_handle = tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT (Ctrl+C) received, shutting down snapshot");
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down snapshot");
            }
        }

        if let Err(err) = shutdown_tx.shutdown() {
            warn!("failed to send shutdown signal: {err:?}");
        }
    });

    let result = pipeline.run().await;

    // The pipeline may finish without any signal, in which case the listener is still waiting.
    shutdown_handle.abort();
    let _ = shutdown_handle.await;

    Ok(result?)
}
