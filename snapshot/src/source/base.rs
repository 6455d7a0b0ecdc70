use std::future::Future;

use crate::error::SnapshotResult;
use crate::types::{Chunk, PgLsn, TableName, TableRow, TableSchema, ViewToken};

/// Name of the ordering column used for tables without a primary key.
///
/// Postgres exposes the physical location of a row as `ctid`, which does not change inside one
/// frozen view, so offsets computed over it are stable across the workers sharing the view.
pub const PHYSICAL_ROW_ID: &str = "ctid";

/// Shape of the key a table is partitioned on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableKey {
    /// The primary key is a single integer column. `min` and `max` are `None` for empty tables.
    SingleInteger {
        column: String,
        min: Option<i64>,
        max: Option<i64>,
    },
    /// Any other table, read in offset chunks ordered by `columns`.
    Ordered { columns: Vec<String> },
}

/// What planning needs to know about a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescription {
    pub schema: TableSchema,
    pub row_count: u64,
    pub key: TableKey,
}

impl TableDescription {
    pub fn table(&self) -> &TableName {
        &self.schema.name
    }
}

/// Ordering columns of a table that has no single integer key.
pub fn ordering_columns(schema: &TableSchema) -> Vec<String> {
    let columns = schema
        .primary_key_columns()
        .map(|column| column.name.clone())
        .collect::<Vec<_>>();

    if columns.is_empty() {
        return vec![PHYSICAL_ROW_ID.to_string()];
    }

    columns
}

/// A repeatable-read transaction whose view has been exported for other sessions to adopt.
///
/// The view stays adoptable for as long as the handle is alive. Dropping the handle ends the
/// transaction just like [`ExportedView::close`] does.
pub trait ExportedView: Send + Sync {
    fn token(&self) -> &ViewToken;

    /// Returns `false` once the session owning the view is gone.
    fn is_alive(&self) -> bool;

    fn close(self) -> impl Future<Output = SnapshotResult<()>> + Send;
}

/// A transaction that adopted an exported view and reads chunks from it.
pub trait ViewReader: Send {
    /// Reads every row of `chunk`, ordered by the chunk's ordering columns.
    ///
    /// Range chunks are fetched in pages of at most `page_size` rows.
    fn read_chunk(
        &mut self,
        chunk: &Chunk,
        page_size: u64,
    ) -> impl Future<Output = SnapshotResult<Vec<TableRow>>> + Send;

    fn commit(self) -> impl Future<Output = SnapshotResult<()>> + Send;

    fn rollback(self) -> impl Future<Output = SnapshotResult<()>> + Send;
}

/// The database being snapshotted.
pub trait SnapshotSource: Clone + Send + Sync + 'static {
    /// Proof of holding an advisory lock. The lock is released when the lease is dropped.
    type Lease: Send + Sync + 'static;

    type View: ExportedView + 'static;

    type Reader: ViewReader + 'static;

    /// Tries to take the session advisory lock identified by `key` without waiting.
    fn try_advisory_lock(
        &self,
        key: &str,
    ) -> impl Future<Output = SnapshotResult<Option<Self::Lease>>> + Send;

    /// Returns the current write-ahead log position.
    fn current_lsn(&self) -> impl Future<Output = SnapshotResult<PgLsn>> + Send;

    /// Introspects a table for planning. Fails with
    /// [`crate::error::ErrorKind::SourceSchemaError`] when the table does not exist.
    fn describe_table(
        &self,
        table: &TableName,
    ) -> impl Future<Output = SnapshotResult<TableDescription>> + Send;

    /// Opens a repeatable-read view and exports it.
    fn export_view(&self) -> impl Future<Output = SnapshotResult<Self::View>> + Send;

    /// Opens a read transaction on the exported view identified by `token`.
    ///
    /// Fails with [`crate::error::ErrorKind::ViewTokenInvalid`] when the view can no longer be
    /// adopted.
    fn adopt_view(
        &self,
        token: &ViewToken,
    ) -> impl Future<Output = SnapshotResult<Self::Reader>> + Send;
}
