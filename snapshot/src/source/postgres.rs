use pg_escape::{quote_identifier, quote_literal};
use rustls::ClientConfig;
use snapshot_config::shared::{IntoConnectOptions, PgConnectionConfig};
use snapshot_postgres::schema::{ColumnSchema, TableName, TableSchema};
use snapshot_postgres::types::convert_type_oid_to_type;
use std::fmt;
use std::io::BufReader;
use std::str::FromStr;
use std::sync::Arc;
use tokio_postgres::error::SqlState;
use tokio_postgres::tls::MakeTlsConnect;
use tokio_postgres::types::PgLsn;
use tokio_postgres::{Client, Config, Connection, NoTls, SimpleQueryMessage, SimpleQueryRow, Socket};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{Instrument, debug, error, info};

use crate::error::{ErrorKind, SnapshotResult};
use crate::source::base::{
    ExportedView, SnapshotSource, TableDescription, TableKey, ViewReader, ordering_columns,
};
use crate::types::{Chunk, ChunkBounds, TableRow, ViewToken};
use crate::{bail, snapshot_error};

/// Spawns a background task driving a Postgres connection until it terminates.
fn spawn_postgres_connection<T>(connection: Connection<Socket, T::Stream>)
where
    T: MakeTlsConnect<Socket>,
    T::Stream: Send + 'static,
{
    let span = tracing::Span::current();
    let task = async move {
        if let Err(e) = connection.await {
            error!("an error occurred during the Postgres connection: {}", e);
            return;
        }

        debug!("postgres connection terminated successfully")
    }
    .instrument(span);

    tokio::spawn(task);
}

/// Opens a dedicated connection, using TLS when the configuration enables it.
async fn connect(pg_connection_config: &PgConnectionConfig) -> SnapshotResult<Client> {
    let config: Config = pg_connection_config.with_db();

    if !pg_connection_config.tls.enabled {
        let (client, connection) = config.connect(NoTls).await?;
        spawn_postgres_connection::<NoTls>(connection);

        return Ok(client);
    }

    let mut root_store = rustls::RootCertStore::empty();
    let mut root_certs_reader =
        BufReader::new(pg_connection_config.tls.trusted_root_certs.as_bytes());
    for cert in rustls_pemfile::certs(&mut root_certs_reader) {
        let cert = cert?;
        root_store.add(cert)?;
    }

    let tls_config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(root_store)
    .with_no_client_auth();

    let (client, connection) = config.connect(MakeRustlsConnect::new(tls_config)).await?;
    spawn_postgres_connection::<MakeRustlsConnect>(connection);

    Ok(client)
}

/// Extracts and parses a column of a simple query row.
fn get_row_value<T: FromStr>(row: &SimpleQueryRow, column_name: &str, source: &str) -> SnapshotResult<T>
where
    T::Err: fmt::Debug,
{
    let value = row.try_get(column_name)?.ok_or(snapshot_error!(
        ErrorKind::SourceSchemaError,
        "Column not found",
        format!("Column '{column_name}' not found in '{source}'")
    ))?;

    value.parse().map_err(|e: T::Err| {
        snapshot_error!(
            ErrorKind::ConversionError,
            "Column parsing failed",
            format!("Failed to parse value from column '{column_name}' in '{source}': {e:?}")
        )
    })
}

/// Extracts a nullable integer column of a simple query row.
fn get_optional_i64(row: &SimpleQueryRow, column_name: &str, source: &str) -> SnapshotResult<Option<i64>> {
    match row.try_get(column_name)? {
        Some(_) => get_row_value(row, column_name, source).map(Some),
        None => Ok(None),
    }
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|message| match message {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn table_row(row: &SimpleQueryRow) -> TableRow {
    let values = (0..row.len())
        .map(|i| row.get(i).map(str::to_string))
        .collect();

    TableRow::new(values)
}

/// Session holding the advisory lock. Closing the session releases the lock.
#[derive(Debug)]
pub struct PgLease {
    _client: Client,
}

/// Exported repeatable-read transaction, kept open on its own session.
#[derive(Debug)]
pub struct PgExportedView {
    client: Client,
    token: ViewToken,
}

impl ExportedView for PgExportedView {
    fn token(&self) -> &ViewToken {
        &self.token
    }

    fn is_alive(&self) -> bool {
        !self.client.is_closed()
    }

    async fn close(self) -> SnapshotResult<()> {
        self.client.simple_query("commit;").await?;

        info!(token = %self.token, "closed the exported view");

        Ok(())
    }
}

/// Read-only transaction running on an adopted view.
#[derive(Debug)]
pub struct PgViewReader {
    client: Client,
}

impl PgViewReader {
    async fn read_range(
        &self,
        chunk: &Chunk,
        start: Option<i64>,
        end: Option<i64>,
        page_size: u64,
    ) -> SnapshotResult<Vec<TableRow>> {
        let Some(key) = chunk.order_by.first() else {
            bail!(
                ErrorKind::InvalidData,
                "Range chunk without a key column",
                format!("chunk {} has no ordering column", chunk.id)
            );
        };
        let quoted_key = quote_identifier(key);
        let table = chunk.table.as_quoted_identifier();

        let mut result = Vec::new();
        // The first page includes `start`, the next ones start after the last key read.
        let mut lower = start.map(|start| format!("{quoted_key} >= {start}"));
        loop {
            let predicates = lower
                .iter()
                .cloned()
                .chain(end.map(|end| format!("{quoted_key} < {end}")))
                .collect::<Vec<_>>();
            let filter = if predicates.is_empty() {
                String::new()
            } else {
                format!("where {}", predicates.join(" and "))
            };

            let query = format!(
                "select * from {table} {filter} order by {quoted_key} limit {page_size};"
            );
            let page = rows(self.client.simple_query(&query).await?);
            let page_len = page.len() as u64;

            let Some(last) = page.last() else {
                break;
            };
            let last_key: i64 = get_row_value(last, key, &chunk.table.to_string())?;
            result.extend(page.iter().map(table_row));

            if page_len < page_size {
                break;
            }
            lower = Some(format!("{quoted_key} > {last_key}"));
        }

        Ok(result)
    }

    async fn read_offset(
        &self,
        chunk: &Chunk,
        start: i64,
        end: Option<i64>,
    ) -> SnapshotResult<Vec<TableRow>> {
        let order_by = chunk
            .order_by
            .iter()
            .map(|column| quote_identifier(column).to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let limit = end
            .map(|end| format!(" limit {}", end - start))
            .unwrap_or_default();

        let query = format!(
            "select * from {} order by {order_by} offset {start}{limit};",
            chunk.table.as_quoted_identifier(),
        );
        let rows = rows(self.client.simple_query(&query).await?);

        Ok(rows.iter().map(table_row).collect())
    }
}

impl ViewReader for PgViewReader {
    async fn read_chunk(&mut self, chunk: &Chunk, page_size: u64) -> SnapshotResult<Vec<TableRow>> {
        match chunk.bounds {
            ChunkBounds::Range { start, end } => {
                self.read_range(chunk, start, end, page_size.max(1)).await
            }
            ChunkBounds::Offset { start, end } => self.read_offset(chunk, start, end).await,
        }
    }

    async fn commit(self) -> SnapshotResult<()> {
        self.client.simple_query("commit;").await?;

        Ok(())
    }

    async fn rollback(self) -> SnapshotResult<()> {
        self.client.simple_query("rollback;").await?;

        Ok(())
    }
}

/// [`SnapshotSource`] backed by a Postgres database.
///
/// Every lease, exported view and reader runs on its own connection, since each of them owns a
/// session-level resource (a lock or a transaction).
#[derive(Debug, Clone)]
pub struct PgSnapshotSource {
    config: PgConnectionConfig,
}

impl PgSnapshotSource {
    pub fn new(config: PgConnectionConfig) -> Self {
        Self { config }
    }

    async fn table_oid(&self, client: &Client, table: &TableName) -> SnapshotResult<u32> {
        let query = format!(
            "select c.oid
            from pg_class c
            join pg_namespace n on n.oid = c.relnamespace
            where n.nspname = {} and c.relname = {} and c.relkind in ('r', 'p');",
            quote_literal(&table.schema),
            quote_literal(&table.name),
        );

        let rows = rows(client.simple_query(&query).await?);
        let Some(row) = rows.first() else {
            bail!(
                ErrorKind::SourceSchemaError,
                "Table not found",
                format!("table '{table}' does not exist in the source database")
            );
        };

        get_row_value(row, "oid", "pg_class")
    }

    async fn column_schemas(&self, client: &Client, table_oid: u32) -> SnapshotResult<Vec<ColumnSchema>> {
        let query = format!(
            "select a.attname,
                a.atttypid,
                a.atttypmod,
                a.attnotnull,
                coalesce(i.indisprimary, false) as primary
            from pg_attribute a
            left join pg_index i
                on a.attrelid = i.indrelid
                and a.attnum = any(i.indkey)
                and i.indisprimary = true
            where a.attnum > 0::int2
            and not a.attisdropped
            and a.attrelid = {table_oid}
            order by a.attnum;"
        );

        let mut column_schemas = vec![];
        for row in rows(client.simple_query(&query).await?) {
            let name = get_row_value::<String>(&row, "attname", "pg_attribute")?;
            let type_oid = get_row_value::<u32>(&row, "atttypid", "pg_attribute")?;
            let modifier = get_row_value::<i32>(&row, "atttypmod", "pg_attribute")?;
            let nullable = get_row_value::<String>(&row, "attnotnull", "pg_attribute")? == "f";
            let primary = get_row_value::<String>(&row, "primary", "pg_index")? == "t";

            column_schemas.push(ColumnSchema::new(
                name,
                convert_type_oid_to_type(type_oid),
                modifier,
                nullable,
                primary,
            ));
        }

        Ok(column_schemas)
    }
}

impl SnapshotSource for PgSnapshotSource {
    type Lease = PgLease;
    type View = PgExportedView;
    type Reader = PgViewReader;

    async fn try_advisory_lock(&self, key: &str) -> SnapshotResult<Option<PgLease>> {
        let client = connect(&self.config).await?;

        let query = format!(
            "select pg_try_advisory_lock(hashtext({})) as locked;",
            quote_literal(key)
        );
        let rows = rows(client.simple_query(&query).await?);
        let locked = match rows.first() {
            Some(row) => get_row_value::<String>(row, "locked", "pg_try_advisory_lock")? == "t",
            None => false,
        };

        if !locked {
            return Ok(None);
        }

        Ok(Some(PgLease { _client: client }))
    }

    async fn current_lsn(&self) -> SnapshotResult<PgLsn> {
        let client = connect(&self.config).await?;

        let rows = rows(
            client
                .simple_query("select pg_current_wal_lsn()::text as lsn;")
                .await?,
        );
        let Some(row) = rows.first() else {
            bail!(
                ErrorKind::SourceQueryFailed,
                "Current WAL position not returned"
            );
        };
        let lsn: String = get_row_value(row, "lsn", "pg_current_wal_lsn")?;

        PgLsn::from_str(&lsn).map_err(|_| {
            snapshot_error!(
                ErrorKind::ConversionError,
                "Invalid WAL position",
                format!("pg_current_wal_lsn returned '{lsn}'")
            )
        })
    }

    async fn describe_table(&self, table: &TableName) -> SnapshotResult<TableDescription> {
        let client = connect(&self.config).await?;

        let table_oid = self.table_oid(&client, table).await?;
        let schema = TableSchema::new(table.clone(), self.column_schemas(&client, table_oid).await?);
        let quoted_table = table.as_quoted_identifier();

        let count_rows = rows(
            client
                .simple_query(&format!("select count(*) as row_count from {quoted_table};"))
                .await?,
        );
        let row_count = match count_rows.first() {
            Some(row) => get_row_value::<u64>(row, "row_count", &table.to_string())?,
            None => 0,
        };

        let key = match schema.single_integer_key() {
            Some(key) => {
                let quoted_key = quote_identifier(&key.name);
                let query = format!(
                    "select min({quoted_key})::int8 as min_key, max({quoted_key})::int8 as max_key from {quoted_table};"
                );
                let rows = rows(client.simple_query(&query).await?);
                let (min, max) = match rows.first() {
                    Some(row) => (
                        get_optional_i64(row, "min_key", &table.to_string())?,
                        get_optional_i64(row, "max_key", &table.to_string())?,
                    ),
                    None => (None, None),
                };

                TableKey::SingleInteger {
                    column: key.name.clone(),
                    min,
                    max,
                }
            }
            None => TableKey::Ordered {
                columns: ordering_columns(&schema),
            },
        };

        debug!(%table, row_count, ?key, "described table");

        Ok(TableDescription {
            schema,
            row_count,
            key,
        })
    }

    async fn export_view(&self) -> SnapshotResult<PgExportedView> {
        let client = connect(&self.config).await?;

        // The exporting session sits idle inside its transaction for the whole snapshot.
        client
            .simple_query("set idle_in_transaction_session_timeout = 0;")
            .await?;
        client.simple_query("set statement_timeout = 0;").await?;

        client
            .simple_query("begin isolation level repeatable read read only;")
            .await?;
        let rows = rows(
            client
                .simple_query("select pg_export_snapshot() as token;")
                .await?,
        );
        let Some(row) = rows.first() else {
            bail!(ErrorKind::SourceQueryFailed, "No exported view token returned");
        };
        let token = ViewToken::new(get_row_value::<String>(row, "token", "pg_export_snapshot")?);

        info!(%token, "exported consistent view");

        Ok(PgExportedView { client, token })
    }

    async fn adopt_view(&self, token: &ViewToken) -> SnapshotResult<PgViewReader> {
        let client = connect(&self.config).await?;

        client
            .simple_query("begin isolation level repeatable read read only;")
            .await?;

        let query = format!("set transaction snapshot {};", quote_literal(token.as_str()));
        if let Err(err) = client.simple_query(&query).await {
            if let Some(code) = err.code()
                && (*code == SqlState::INVALID_PARAMETER_VALUE
                    || *code == SqlState::OBJECT_NOT_IN_PREREQUISITE_STATE)
            {
                bail!(
                    ErrorKind::ViewTokenInvalid,
                    "The exported view can no longer be adopted",
                    format!("view {token}: {err}")
                );
            }

            return Err(err.into());
        }

        Ok(PgViewReader { client })
    }
}
