use snapshot_config::shared::{IntoConnectOptions, PgConnectionConfig};
use sqlx::{
    Executor,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use tracing::info;

/// Number of database connections to use for the migration pool.
const NUM_POOL_CONNECTIONS: u32 = 1;

/// Creates the `snapshot` schema and applies pending migrations of the metadata store.
///
/// The `_sqlx_migrations` bookkeeping table lands in the `snapshot` schema too, keeping the
/// source database's `public` schema untouched.
pub async fn migrate_metadata_store(
    connection_config: &PgConnectionConfig,
) -> Result<(), sqlx::Error> {
    let options: PgConnectOptions = connection_config.with_db();

    let pool = PgPoolOptions::new()
        .max_connections(NUM_POOL_CONNECTIONS)
        .min_connections(NUM_POOL_CONNECTIONS)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("create schema if not exists snapshot;").await?;
                conn.execute("set search_path = 'snapshot';").await?;

                Ok(())
            })
        })
        .connect_with(options)
        .await?;

    info!("applying snapshot metadata migrations");

    let migrator = sqlx::migrate!("./migrations");
    migrator.run(&pool).await?;
    pool.close().await;

    info!("snapshot metadata migrations applied");

    Ok(())
}
