use crate::config::load_replicator_config;
use crate::core::start_replicator_with_config;
use snapshot_config::shared::ReplicatorConfig;
use snapshot_telemetry::init_tracing;
use tracing::error;

mod config;
mod core;
mod migrations;

fn main() -> anyhow::Result<()> {
    let replicator_config = load_replicator_config()?;

    let _log_flusher = init_tracing(env!("CARGO_BIN_NAME"))?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(replicator_config))?;

    Ok(())
}

async fn async_main(replicator_config: ReplicatorConfig) -> anyhow::Result<()> {
    if let Err(err) = start_replicator_with_config(replicator_config).await {
        error!("an error occurred in the snapshot replicator: {err}");

        return Err(err);
    }

    Ok(())
}
