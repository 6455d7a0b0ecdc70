use snapshot_config::shared::{IntoConnectOptions, PgConnectionConfig};
use tokio::runtime::Handle;
use tokio_postgres::{Client, NoTls};
use tracing::info;

use crate::schema::TableName;

/// A throwaway database for integration tests.
///
/// The database is created on construction and dropped together with every open connection when
/// the value is dropped.
pub struct PgDatabase {
    pub config: PgConnectionConfig,
    pub client: Client,
}

impl PgDatabase {
    /// Creates the database named in `config` and connects to it.
    pub async fn new(config: PgConnectionConfig) -> Self {
        let client = create_pg_database(&config).await;

        Self { config, client }
    }

    /// Creates a table, optionally prefixed with an `id bigserial primary key` column.
    pub async fn create_table(
        &self,
        table_name: &TableName,
        add_pk_col: bool,
        columns: &[(&str, &str)],
    ) -> Result<(), tokio_postgres::Error> {
        let columns_str = columns
            .iter()
            .map(|(name, typ)| format!("{name} {typ}"))
            .collect::<Vec<_>>()
            .join(", ");

        let pk_col = if add_pk_col {
            "id bigserial primary key, "
        } else {
            ""
        };

        let query = format!(
            "create table {} ({pk_col}{columns_str})",
            table_name.as_quoted_identifier(),
        );
        self.client.execute(&query, &[]).await?;

        Ok(())
    }

    /// Inserts one row per value of `generate_series(start, end)` into every listed column.
    pub async fn insert_generate_series(
        &self,
        table_name: &TableName,
        columns: &[&str],
        start: i64,
        end: i64,
    ) -> Result<u64, tokio_postgres::Error> {
        let values = columns
            .iter()
            .map(|_| format!("generate_series({start}, {end})"))
            .collect::<Vec<_>>()
            .join(", ");

        let query = format!(
            "insert into {} ({}) select {values}",
            table_name.as_quoted_identifier(),
            columns.join(", "),
        );

        self.client.execute(&query, &[]).await
    }

    /// Executes arbitrary SQL and returns the affected row count.
    pub async fn run_sql(&self, sql: &str) -> Result<u64, tokio_postgres::Error> {
        self.client.execute(sql, &[]).await
    }
}

impl Drop for PgDatabase {
    fn drop(&mut self) {
        let config = self.config.clone();
        // `block_in_place` requires the multi-threaded runtime.
        tokio::task::block_in_place(move || {
            Handle::current().block_on(async move { drop_pg_database(&config).await });
        });
    }
}

async fn connect(config: tokio_postgres::Config) -> Client {
    let (client, connection) = config
        .connect(NoTls)
        .await
        .expect("Failed to connect to Postgres");

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            info!("test connection error: {e}");
        }
    });

    client
}

/// Creates the database named in `config` and returns a client connected to it.
pub async fn create_pg_database(config: &PgConnectionConfig) -> Client {
    let admin = connect(config.without_db()).await;
    admin
        .execute(&*format!(r#"create database "{}";"#, config.name), &[])
        .await
        .expect("Failed to create database");

    connect(config.with_db()).await
}

/// Terminates every connection to the database named in `config` and drops it.
pub async fn drop_pg_database(config: &PgConnectionConfig) {
    let admin = connect(config.without_db()).await;

    admin
        .execute(
            "select pg_terminate_backend(pid) from pg_stat_activity \
             where datname = $1 and pid <> pg_backend_pid()",
            &[&config.name],
        )
        .await
        .expect("Failed to terminate database connections");

    admin
        .execute(
            &*format!(r#"drop database if exists "{}";"#, config.name),
            &[],
        )
        .await
        .expect("Failed to drop database");
}
