use snapshot_config::shared::{PgConnectionConfig, TlsConfig};
use snapshot_postgres::schema::TableName;
use snapshot_postgres::tokio::test_utils::PgDatabase;
use uuid::Uuid;

use crate::store::postgres::PostgresMetadataStore;

/// Schema holding the tables created by tests.
const TEST_DATABASE_SCHEMA: &str = "test";

/// Creates a [`TableName`] in the test schema.
pub fn test_table_name(name: &str) -> TableName {
    TableName::new(TEST_DATABASE_SCHEMA, name)
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

/// Connection parameters of the local Postgres instance, overridable through `TESTS_DATABASE_*`
/// environment variables.
fn local_pg_connection_config() -> PgConnectionConfig {
    PgConnectionConfig {
        host: env_or("TESTS_DATABASE_HOST", "localhost"),
        port: env_or("TESTS_DATABASE_PORT", "5430")
            .parse()
            .expect("TESTS_DATABASE_PORT is not a valid port"),
        // A random name keeps concurrent tests apart.
        name: Uuid::new_v4().to_string(),
        username: env_or("TESTS_DATABASE_USERNAME", "postgres"),
        password: Some(env_or("TESTS_DATABASE_PASSWORD", "postgres").into()),
        tls: TlsConfig {
            trusted_root_certs: String::new(),
            enabled: false,
        },
    }
}

/// Creates a fresh database with an empty test schema.
///
/// # Panics
///
/// Panics if the database or the test schema cannot be created.
pub async fn spawn_source_database() -> PgDatabase {
    let database = PgDatabase::new(local_pg_connection_config()).await;

    database
        .run_sql(&format!("create schema {TEST_DATABASE_SCHEMA}"))
        .await
        .expect("Failed to create test schema");

    database
}

/// Creates a fresh database with the metadata store migrations applied, and a store connected
/// to it.
///
/// # Panics
///
/// Panics if the database cannot be created or the migrations fail.
pub async fn spawn_source_database_with_store() -> (PgDatabase, PostgresMetadataStore) {
    let database = spawn_source_database().await;

    // A single connection, so that the search path set below applies to the migrations and the
    // sqlx bookkeeping table lands in the `snapshot` schema.
    let migrator = PostgresMetadataStore::connect(&database.config, 1)
        .await
        .expect("Failed to connect with sqlx");

    sqlx::query("create schema if not exists snapshot")
        .execute(migrator.pool())
        .await
        .expect("Failed to create 'snapshot' schema");

    sqlx::query("set search_path = 'snapshot';")
        .execute(migrator.pool())
        .await
        .expect("Failed to set search path to 'snapshot'");

    sqlx::migrate!("../snapshot-replicator/migrations")
        .run(migrator.pool())
        .await
        .expect("Failed to run snapshot migrations");

    migrator.pool().close().await;

    let store = PostgresMetadataStore::connect(&database.config, 16)
        .await
        .expect("Failed to connect the metadata store");

    (database, store)
}
