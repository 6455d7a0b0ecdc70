use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio_postgres::types::PgLsn;

use crate::bail;
use crate::error::{ErrorKind, SnapshotResult};
use crate::source::base::{
    ExportedView, PHYSICAL_ROW_ID, SnapshotSource, TableDescription, TableKey, ViewReader,
    ordering_columns,
};
use crate::types::{Chunk, ChunkBounds, TableName, TableRow, TableSchema, ViewToken};

/// Version a row is visible at: created at or before it and not deleted at or before it.
#[derive(Debug, Clone)]
struct VersionedRow {
    values: Vec<Option<String>>,
    created: u64,
    deleted: Option<u64>,
}

impl VersionedRow {
    fn visible_at(&self, version: u64) -> bool {
        self.created <= version && self.deleted.is_none_or(|deleted| deleted > version)
    }
}

#[derive(Debug)]
struct MemoryTable {
    schema: TableSchema,
    /// Rows in physical order, every version of a row kept.
    rows: Vec<VersionedRow>,
}

impl MemoryTable {
    fn column(&self, name: &str) -> SnapshotResult<usize> {
        match self.schema.column_index(name) {
            Some(index) => Ok(index),
            None => bail!(
                ErrorKind::SourceSchemaError,
                "Column not found",
                format!("column '{name}' does not exist in '{}'", self.schema.name)
            ),
        }
    }

    /// Visible rows in physical order.
    fn visible(&self, version: u64) -> impl Iterator<Item = &VersionedRow> {
        self.rows.iter().filter(move |row| row.visible_at(version))
    }

    fn integer_key(&self, row: &VersionedRow, index: usize) -> Option<i64> {
        row.values
            .get(index)
            .and_then(|value| value.as_deref())
            .and_then(|value| value.parse().ok())
    }
}

fn compare_values(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => match (a.parse::<i64>(), b.parse::<i64>()) {
            (Ok(a), Ok(b)) => a.cmp(&b),
            _ => a.cmp(b),
        },
        // Nulls sort last, as in Postgres.
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[derive(Debug, Default)]
struct Inner {
    tables: BTreeMap<TableName, MemoryTable>,
    /// Position of the last write. Every write gets its own position.
    lsn: u64,
    advisory_locks: HashSet<String>,
    /// Exported views by token, with the version they see.
    exported_views: HashMap<String, u64>,
    next_view: u64,
    failing_reads: u32,
}

impl Inner {
    fn table(&self, name: &TableName) -> SnapshotResult<&MemoryTable> {
        match self.tables.get(name) {
            Some(table) => Ok(table),
            None => bail!(
                ErrorKind::SourceSchemaError,
                "Table not found",
                format!("table '{name}' does not exist in the source database")
            ),
        }
    }

    fn table_mut(&mut self, name: &TableName) -> SnapshotResult<&mut MemoryTable> {
        match self.tables.get_mut(name) {
            Some(table) => Ok(table),
            None => bail!(
                ErrorKind::SourceSchemaError,
                "Table not found",
                format!("table '{name}' does not exist in the source database")
            ),
        }
    }

    /// Marks the visible rows whose `column` equals `key` as deleted at `version`.
    fn delete_matching(
        &mut self,
        table: &TableName,
        column: &str,
        key: &str,
        version: u64,
    ) -> SnapshotResult<Vec<VersionedRow>> {
        let table = self.table_mut(table)?;
        let index = table.column(column)?;

        let mut deleted = Vec::new();
        for row in table.rows.iter_mut() {
            if row.deleted.is_none() && row.values.get(index).and_then(|v| v.as_deref()) == Some(key)
            {
                row.deleted = Some(version);
                deleted.push(row.clone());
            }
        }

        Ok(deleted)
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An in-memory source database with multi-version rows.
///
/// Writes are stamped with increasing log positions and exported views see the rows visible at
/// the position they were exported at, so a view is unaffected by later writes just like a
/// repeatable-read view of Postgres. Failures can be injected to exercise recovery: exported views
/// can be killed, reads blocked or made to fail.
///
/// Clones share the same database, so one source can back several instances.
#[derive(Debug, Clone)]
pub struct MemorySource {
    inner: Arc<Mutex<Inner>>,
    reads_blocked: Arc<watch::Sender<bool>>,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    pub fn new() -> Self {
        let (reads_blocked, _) = watch::channel(false);

        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            reads_blocked: Arc::new(reads_blocked),
        }
    }

    pub fn create_table(&self, schema: TableSchema) {
        let mut inner = lock(&self.inner);
        inner.tables.insert(
            schema.name.clone(),
            MemoryTable {
                schema,
                rows: Vec::new(),
            },
        );
    }

    /// Inserts a row and returns the position of the write.
    pub fn insert(&self, table: &TableName, values: Vec<Option<String>>) -> SnapshotResult<PgLsn> {
        let mut inner = lock(&self.inner);
        let version = inner.lsn + 1;

        let table = inner.table_mut(table)?;
        if values.len() != table.schema.column_schemas.len() {
            bail!(
                ErrorKind::InvalidData,
                "Row does not match the table columns",
                format!(
                    "'{}' has {} columns, the row has {} values",
                    table.schema.name,
                    table.schema.column_schemas.len(),
                    values.len()
                )
            );
        }
        table.rows.push(VersionedRow {
            values,
            created: version,
            deleted: None,
        });

        inner.lsn = version;

        Ok(PgLsn::from(version))
    }

    /// Replaces the rows whose `column` equals `key` with `values`.
    pub fn update(
        &self,
        table: &TableName,
        column: &str,
        key: &str,
        values: Vec<Option<String>>,
    ) -> SnapshotResult<PgLsn> {
        let mut inner = lock(&self.inner);
        let version = inner.lsn + 1;

        let deleted = inner.delete_matching(table, column, key, version)?;
        let table = inner.table_mut(table)?;
        for _ in deleted {
            table.rows.push(VersionedRow {
                values: values.clone(),
                created: version,
                deleted: None,
            });
        }

        inner.lsn = version;

        Ok(PgLsn::from(version))
    }

    /// Deletes the rows whose `column` equals `key`.
    pub fn delete(&self, table: &TableName, column: &str, key: &str) -> SnapshotResult<PgLsn> {
        let mut inner = lock(&self.inner);
        let version = inner.lsn + 1;

        inner.delete_matching(table, column, key, version)?;
        inner.lsn = version;

        Ok(PgLsn::from(version))
    }

    /// Ends every exported view, as if the sessions owning them had died.
    pub fn kill_exported_views(&self) {
        lock(&self.inner).exported_views.clear();
    }

    pub fn exported_view_count(&self) -> usize {
        lock(&self.inner).exported_views.len()
    }

    /// Makes chunk reads wait until [`MemorySource::unblock_reads`] is called.
    pub fn block_reads(&self) {
        self.reads_blocked.send_replace(true);
    }

    pub fn unblock_reads(&self) {
        self.reads_blocked.send_replace(false);
    }

    /// Makes the next `count` chunk reads fail.
    pub fn fail_next_reads(&self, count: u32) {
        lock(&self.inner).failing_reads = count;
    }
}

/// Advisory lock held until dropped.
#[derive(Debug)]
pub struct MemoryLease {
    key: String,
    inner: Arc<Mutex<Inner>>,
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        lock(&self.inner).advisory_locks.remove(&self.key);
    }
}

#[derive(Debug)]
pub struct MemoryExportedView {
    token: ViewToken,
    inner: Arc<Mutex<Inner>>,
}

impl ExportedView for MemoryExportedView {
    fn token(&self) -> &ViewToken {
        &self.token
    }

    fn is_alive(&self) -> bool {
        lock(&self.inner)
            .exported_views
            .contains_key(self.token.as_str())
    }

    async fn close(self) -> SnapshotResult<()> {
        // Dropping ends the view.
        Ok(())
    }
}

impl Drop for MemoryExportedView {
    fn drop(&mut self) {
        lock(&self.inner)
            .exported_views
            .remove(self.token.as_str());
    }
}

#[derive(Debug)]
pub struct MemoryViewReader {
    version: u64,
    inner: Arc<Mutex<Inner>>,
    reads_blocked: Arc<watch::Sender<bool>>,
}

impl MemoryViewReader {
    fn read(&self, chunk: &Chunk) -> SnapshotResult<Vec<TableRow>> {
        let mut inner = lock(&self.inner);

        if inner.failing_reads > 0 {
            inner.failing_reads -= 1;
            bail!(
                ErrorKind::SourceQueryFailed,
                "Chunk read failed",
                format!("injected failure while reading chunk {}", chunk.id)
            );
        }

        let table = inner.table(&chunk.table)?;
        let rows = match chunk.bounds {
            ChunkBounds::Range { .. } => {
                let Some(key) = chunk.order_by.first() else {
                    bail!(
                        ErrorKind::InvalidData,
                        "Range chunk without a key column",
                        format!("chunk {} has no ordering column", chunk.id)
                    );
                };
                let index = table.column(key)?;

                let mut rows = table
                    .visible(self.version)
                    .filter_map(|row| {
                        let key = table.integer_key(row, index)?;
                        chunk.bounds.contains(key).then_some((key, row))
                    })
                    .collect::<Vec<_>>();
                rows.sort_by_key(|(key, _)| *key);

                rows.into_iter()
                    .map(|(_, row)| TableRow::new(row.values.clone()))
                    .collect()
            }
            ChunkBounds::Offset { start, end } => {
                let mut rows = table.visible(self.version).collect::<Vec<_>>();

                if chunk.order_by.iter().all(|column| column != PHYSICAL_ROW_ID) {
                    let indices = chunk
                        .order_by
                        .iter()
                        .map(|column| table.column(column))
                        .collect::<SnapshotResult<Vec<_>>>()?;

                    rows.sort_by(|a, b| {
                        indices
                            .iter()
                            .map(|&i| {
                                compare_values(
                                    a.values.get(i).and_then(|v| v.as_deref()),
                                    b.values.get(i).and_then(|v| v.as_deref()),
                                )
                            })
                            .find(|ordering| ordering.is_ne())
                            .unwrap_or(Ordering::Equal)
                    });
                }

                let start = usize::try_from(start).unwrap_or(0);
                let take = end
                    .and_then(|end| usize::try_from(end).ok())
                    .map_or(usize::MAX, |end| end.saturating_sub(start));

                rows.into_iter()
                    .skip(start)
                    .take(take)
                    .map(|row| TableRow::new(row.values.clone()))
                    .collect()
            }
        };

        Ok(rows)
    }
}

impl ViewReader for MemoryViewReader {
    async fn read_chunk(&mut self, chunk: &Chunk, _page_size: u64) -> SnapshotResult<Vec<TableRow>> {
        let mut blocked = self.reads_blocked.subscribe();
        if blocked.wait_for(|blocked| !*blocked).await.is_err() {
            bail!(ErrorKind::SourceConnectionFailed, "Source closed");
        }

        self.read(chunk)
    }

    async fn commit(self) -> SnapshotResult<()> {
        Ok(())
    }

    async fn rollback(self) -> SnapshotResult<()> {
        Ok(())
    }
}

impl SnapshotSource for MemorySource {
    type Lease = MemoryLease;
    type View = MemoryExportedView;
    type Reader = MemoryViewReader;

    async fn try_advisory_lock(&self, key: &str) -> SnapshotResult<Option<MemoryLease>> {
        let mut inner = lock(&self.inner);

        if !inner.advisory_locks.insert(key.to_string()) {
            return Ok(None);
        }

        Ok(Some(MemoryLease {
            key: key.to_string(),
            inner: self.inner.clone(),
        }))
    }

    async fn current_lsn(&self) -> SnapshotResult<PgLsn> {
        Ok(PgLsn::from(lock(&self.inner).lsn))
    }

    async fn describe_table(&self, table: &TableName) -> SnapshotResult<TableDescription> {
        let inner = lock(&self.inner);
        let memory_table = inner.table(table)?;
        let schema = memory_table.schema.clone();

        let row_count = memory_table.visible(inner.lsn).count() as u64;
        let key = match schema.single_integer_key() {
            Some(key) => {
                let index = memory_table.column(&key.name)?;
                let keys = memory_table
                    .visible(inner.lsn)
                    .filter_map(|row| memory_table.integer_key(row, index))
                    .collect::<Vec<_>>();

                TableKey::SingleInteger {
                    column: key.name.clone(),
                    min: keys.iter().min().copied(),
                    max: keys.iter().max().copied(),
                }
            }
            None => TableKey::Ordered {
                columns: ordering_columns(&schema),
            },
        };

        Ok(TableDescription {
            schema,
            row_count,
            key,
        })
    }

    async fn export_view(&self) -> SnapshotResult<MemoryExportedView> {
        let mut inner = lock(&self.inner);

        inner.next_view += 1;
        let token = ViewToken::new(format!("{:08X}-{:08X}-1", inner.next_view, inner.lsn));
        let version = inner.lsn;
        inner
            .exported_views
            .insert(token.as_str().to_string(), version);

        Ok(MemoryExportedView {
            token,
            inner: self.inner.clone(),
        })
    }

    async fn adopt_view(&self, token: &ViewToken) -> SnapshotResult<MemoryViewReader> {
        let inner = lock(&self.inner);

        let Some(version) = inner.exported_views.get(token.as_str()).copied() else {
            bail!(
                ErrorKind::ViewTokenInvalid,
                "The exported view can no longer be adopted",
                format!("view {token} does not exist")
            );
        };

        Ok(MemoryViewReader {
            version,
            inner: self.inner.clone(),
            reads_blocked: self.reads_blocked.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChunkStatus, ColumnSchema};
    use tokio_postgres::types::Type;

    fn orders() -> TableName {
        TableName::new("public", "orders")
    }

    fn source_with_orders(rows: i64) -> MemorySource {
        let source = MemorySource::new();
        source.create_table(TableSchema::new(
            orders(),
            vec![
                ColumnSchema::new("id", Type::INT8, -1, false, true),
                ColumnSchema::new("amount", Type::INT4, -1, true, false),
            ],
        ));
        for id in 1..=rows {
            source
                .insert(&orders(), vec![Some(id.to_string()), Some("10".to_string())])
                .unwrap();
        }

        source
    }

    fn chunk(bounds: ChunkBounds, order_by: &str) -> Chunk {
        Chunk {
            id: 1,
            job_id: 1,
            table: orders(),
            order_by: vec![order_by.to_string()],
            bounds,
            status: ChunkStatus::InProgress,
            claimed_by: None,
            claimed_at: None,
            heartbeat_at: None,
            attempts: 1,
            last_error: None,
        }
    }

    fn ids(rows: &[TableRow]) -> Vec<String> {
        rows.iter()
            .filter_map(|row| row.value(0).map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn views_do_not_see_later_writes() {
        let source = source_with_orders(3);
        let view = source.export_view().await.unwrap();

        source
            .insert(&orders(), vec![Some("4".to_string()), None])
            .unwrap();
        source.delete(&orders(), "id", "1").unwrap();

        let mut reader = source.adopt_view(view.token()).await.unwrap();
        let rows = reader
            .read_chunk(
                &chunk(
                    ChunkBounds::Range {
                        start: None,
                        end: None,
                    },
                    "id",
                ),
                100,
            )
            .await
            .unwrap();

        assert_eq!(ids(&rows), vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn offset_reads_follow_the_ordering_columns() {
        let source = source_with_orders(10);
        // Updating moves the row to the end of the physical order.
        source
            .update(
                &orders(),
                "id",
                "2",
                vec![Some("2".to_string()), Some("20".to_string())],
            )
            .unwrap();
        let view = source.export_view().await.unwrap();
        let mut reader = source.adopt_view(view.token()).await.unwrap();

        let by_key = reader
            .read_chunk(
                &chunk(
                    ChunkBounds::Offset {
                        start: 1,
                        end: Some(3),
                    },
                    "id",
                ),
                100,
            )
            .await
            .unwrap();
        assert_eq!(ids(&by_key), vec!["2", "3"]);

        let physical = reader
            .read_chunk(
                &chunk(
                    ChunkBounds::Offset {
                        start: 8,
                        end: None,
                    },
                    PHYSICAL_ROW_ID,
                ),
                100,
            )
            .await
            .unwrap();
        assert_eq!(ids(&physical), vec!["10", "2"]);
    }

    #[tokio::test]
    async fn killed_views_cannot_be_adopted() {
        let source = source_with_orders(1);
        let view = source.export_view().await.unwrap();
        assert!(view.is_alive());

        source.kill_exported_views();

        assert!(!view.is_alive());
        let err = source.adopt_view(view.token()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ViewTokenInvalid);
    }

    #[tokio::test]
    async fn advisory_locks_are_released_with_the_lease() {
        let source = MemorySource::new();

        let lease = source.try_advisory_lock("slot").await.unwrap();
        assert!(lease.is_some());
        assert!(source.try_advisory_lock("slot").await.unwrap().is_none());
        assert!(source.try_advisory_lock("other").await.unwrap().is_some());

        drop(lease);
        assert!(source.try_advisory_lock("slot").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn describes_the_key_shape() {
        let source = source_with_orders(5);
        source.delete(&orders(), "id", "5").unwrap();

        let description = source.describe_table(&orders()).await.unwrap();
        assert_eq!(description.row_count, 4);
        assert_eq!(
            description.key,
            TableKey::SingleInteger {
                column: "id".to_string(),
                min: Some(1),
                max: Some(4),
            }
        );

        let err = source
            .describe_table(&TableName::new("public", "missing"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SourceSchemaError);
    }

    #[tokio::test]
    async fn injected_read_failures_are_consumed() {
        let source = source_with_orders(2);
        let view = source.export_view().await.unwrap();
        let mut reader = source.adopt_view(view.token()).await.unwrap();
        let all = chunk(
            ChunkBounds::Range {
                start: None,
                end: None,
            },
            "id",
        );

        source.fail_next_reads(1);
        assert!(reader.read_chunk(&all, 10).await.is_err());
        assert_eq!(reader.read_chunk(&all, 10).await.unwrap().len(), 2);
    }
}
