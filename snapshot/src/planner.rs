//! Partitioning of the configured tables into chunks.

use snapshot_config::shared::SnapshotConfig;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::{ErrorKind, SnapshotResult};
use crate::snapshot_error;
use crate::source::base::{SnapshotSource, TableDescription, TableKey};
use crate::store::base::MetadataStore;
use crate::types::{ChunkBounds, ChunkPlan, JobStatus, SnapshotJob, TableName};
use crate::utils::retry::with_retry;

/// Number of chunks needed for `row_count` rows, never less than one.
fn chunk_count(row_count: u64, chunk_size: u64) -> u64 {
    row_count.div_ceil(chunk_size.max(1)).max(1)
}

/// Splits `[min, max]` into `count` bands of equal width, returning the inner boundaries.
///
/// Boundaries past `max` are dropped, so fewer bands than requested come out when the key
/// space is narrower than `count`.
fn range_boundaries(min: i64, max: i64, count: u64) -> Vec<i64> {
    let span = i128::from(max) - i128::from(min) + 1;
    let count = i128::from(count);
    let width = (span + count - 1) / count;

    (1..count)
        .map(|i| i128::from(min) + i * width)
        .take_while(|boundary| *boundary <= i128::from(max))
        .filter_map(|boundary| i64::try_from(boundary).ok())
        .collect()
}

/// Computes the chunks of one table.
///
/// Tables keyed by a single integer column get equal-width key ranges, the first unbounded below
/// and the last unbounded above so keys inserted after planning are still covered. Every other
/// table gets offset chunks of `chunk_size` rows, the last one unbounded.
pub fn plan_chunks(description: &TableDescription, chunk_size: u64) -> Vec<ChunkPlan> {
    let table = description.table().clone();
    let count = chunk_count(description.row_count, chunk_size);

    match &description.key {
        TableKey::SingleInteger {
            column,
            min: Some(min),
            max: Some(max),
        } => {
            let boundaries = range_boundaries(*min, *max, count);

            let starts = std::iter::once(None).chain(boundaries.iter().copied().map(Some));
            let ends = boundaries
                .iter()
                .copied()
                .map(Some)
                .chain(std::iter::once(None));

            starts
                .zip(ends)
                .map(|(start, end)| ChunkPlan {
                    table: table.clone(),
                    order_by: vec![column.clone()],
                    bounds: ChunkBounds::Range { start, end },
                })
                .collect()
        }
        TableKey::SingleInteger { column, .. } => vec![ChunkPlan {
            table,
            order_by: vec![column.clone()],
            bounds: ChunkBounds::Range {
                start: None,
                end: None,
            },
        }],
        TableKey::Ordered { columns } => {
            let size = i64::try_from(chunk_size.max(1)).unwrap_or(i64::MAX);
            let count = i64::try_from(count).unwrap_or(i64::MAX);

            (0..count)
                .map(|i| {
                    let start = i.saturating_mul(size);
                    let end = (i + 1 < count).then(|| start.saturating_add(size));

                    ChunkPlan {
                        table: table.clone(),
                        order_by: columns.clone(),
                        bounds: ChunkBounds::Offset { start, end },
                    }
                })
                .collect()
        }
    }
}

/// Creates a job, partitions every configured table and persists the plan.
#[derive(Debug)]
pub struct SnapshotPlanner<S, M> {
    config: Arc<SnapshotConfig>,
    source: S,
    store: M,
}

impl<S, M> SnapshotPlanner<S, M>
where
    S: SnapshotSource,
    M: MetadataStore + Sync,
{
    pub fn new(config: Arc<SnapshotConfig>, source: S, store: M) -> Self {
        Self {
            config,
            source,
            store,
        }
    }

    /// Plans a new job and leaves it in [`JobStatus::Exporting`].
    ///
    /// The fence position is captured before anything else. Fails with
    /// [`ErrorKind::LiveJobExists`] when another instance already planned a job, and with
    /// [`ErrorKind::PlanningFailed`] when a table cannot be introspected, in which case the job is
    /// marked failed without chunks.
    pub async fn plan(&self) -> SnapshotResult<SnapshotJob> {
        let mut seen = HashSet::new();
        let mut tables = Vec::with_capacity(self.config.tables.len());
        for table in &self.config.tables {
            let table = table.parse::<TableName>()?;
            // `orders` and `public.orders` are the same table and must be read only once.
            if seen.insert(table.clone()) {
                tables.push(table);
            } else {
                warn!(%table, "table is configured more than once, planning it once");
            }
        }

        let fence_lsn = with_retry(&self.config.store_retry, "reading the fence position", || {
            self.source.current_lsn()
        })
        .await?;

        let mut job = self.store.create_job(&self.config.endpoint, fence_lsn).await?;
        info!(job_id = job.id, %fence_lsn, "created snapshot job");

        let plans = match self.partition(&tables).await {
            Ok(plans) => plans,
            Err(err) => {
                error!(job_id = job.id, error = %err, "snapshot planning failed");
                self.store.fail_job(job.id, &err.to_string()).await?;

                return Err(snapshot_error!(
                    ErrorKind::PlanningFailed,
                    "Snapshot planning failed",
                    err
                ));
            }
        };

        let chunk_count = self.store.store_plan(job.id, plans).await?;
        job.status = JobStatus::Exporting;

        info!(
            job_id = job.id,
            tables = tables.len(),
            chunk_count,
            "stored snapshot plan"
        );

        Ok(job)
    }

    async fn partition(&self, tables: &[TableName]) -> SnapshotResult<Vec<ChunkPlan>> {
        let mut plans = Vec::new();

        for table in tables {
            let description = with_retry(&self.config.store_retry, "describing a table", || {
                self.source.describe_table(table)
            })
            .await?;

            let table_plans = plan_chunks(&description, self.config.chunk_size);
            info!(
                %table,
                row_count = description.row_count,
                chunks = table_plans.len(),
                "partitioned table"
            );

            plans.extend(table_plans);
        }

        Ok(plans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::memory::MemorySource;
    use crate::store::memory::MemoryMetadataStore;
    use crate::types::{ColumnSchema, TableSchema};
    use snapshot_config::shared::SnapshotMode;
    use tokio_postgres::types::Type;

    fn description(key: TableKey, row_count: u64) -> TableDescription {
        TableDescription {
            schema: TableSchema::new(TableName::new("public", "t"), vec![]),
            row_count,
            key,
        }
    }

    fn integer_key(min: i64, max: i64) -> TableKey {
        TableKey::SingleInteger {
            column: "id".to_string(),
            min: Some(min),
            max: Some(max),
        }
    }

    /// Asserts that range chunks are contiguous, open at both ends and cover every key once.
    fn assert_range_coverage(plans: &[ChunkPlan], min: i64, max: i64) {
        let bounds = plans
            .iter()
            .map(|plan| match plan.bounds {
                ChunkBounds::Range { start, end } => (start, end),
                ChunkBounds::Offset { .. } => panic!("expected range bounds"),
            })
            .collect::<Vec<_>>();

        assert_eq!(bounds.first().map(|b| b.0), Some(None));
        assert_eq!(bounds.last().map(|b| b.1), Some(None));
        for pair in bounds.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
            assert!(pair[1].0.is_some());
        }

        for key in [i64::MIN, min - 1, min, max, max + 1, i64::MAX]
            .into_iter()
            .chain((min..=max).step_by(((max - min) / 97).max(1) as usize))
        {
            let owners = plans.iter().filter(|plan| plan.bounds.contains(key)).count();
            assert_eq!(owners, 1, "key {key} covered {owners} times");
        }
    }

    #[test]
    fn integer_keys_are_split_in_equal_bands() {
        let plans = plan_chunks(&description(integer_key(1, 1000), 1000), 100);

        assert_eq!(plans.len(), 10);
        assert_eq!(
            plans[1].bounds,
            ChunkBounds::Range {
                start: Some(101),
                end: Some(201)
            }
        );
        assert_range_coverage(&plans, 1, 1000);
    }

    #[test]
    fn range_plans_cover_the_key_space() {
        for (min, max, rows, chunk_size) in [
            (1, 1, 1, 10),
            (1, 5, 5, 1),
            (-50, 50, 101, 7),
            (0, 1_000_000, 10, 3),
            (10, 20, 1000, 1),
            (i64::MIN / 2, i64::MAX / 2, 1_000_000, 1000),
        ] {
            let plans = plan_chunks(&description(integer_key(min, max), rows), chunk_size);

            assert!(!plans.is_empty());
            assert!(plans.len() as u64 <= chunk_count(rows, chunk_size));
            assert_range_coverage(&plans, min, max);
        }
    }

    #[test]
    fn empty_tables_get_a_single_open_chunk() {
        let key = TableKey::SingleInteger {
            column: "id".to_string(),
            min: None,
            max: None,
        };
        let plans = plan_chunks(&description(key, 0), 100);
        assert_eq!(
            plans
                .iter()
                .map(|plan| plan.bounds)
                .collect::<Vec<_>>(),
            vec![ChunkBounds::Range {
                start: None,
                end: None
            }]
        );

        let ordered = TableKey::Ordered {
            columns: vec!["ctid".to_string()],
        };
        let plans = plan_chunks(&description(ordered, 0), 100);
        assert_eq!(
            plans[0].bounds,
            ChunkBounds::Offset {
                start: 0,
                end: None
            }
        );
    }

    #[test]
    fn offset_chunks_are_contiguous_and_open_ended() {
        let key = TableKey::Ordered {
            columns: vec!["tenant".to_string(), "code".to_string()],
        };
        let plans = plan_chunks(&description(key, 250), 100);

        let bounds = plans.iter().map(|plan| plan.bounds).collect::<Vec<_>>();
        assert_eq!(
            bounds,
            vec![
                ChunkBounds::Offset {
                    start: 0,
                    end: Some(100)
                },
                ChunkBounds::Offset {
                    start: 100,
                    end: Some(200)
                },
                ChunkBounds::Offset {
                    start: 200,
                    end: None
                },
            ]
        );
        assert!(plans.iter().all(|plan| plan.order_by == ["tenant", "code"]));
    }

    fn source_with_table(rows: i64) -> MemorySource {
        let source = MemorySource::new();
        let table = TableName::new("public", "orders");
        source.create_table(TableSchema::new(
            table.clone(),
            vec![ColumnSchema::new("id", Type::INT4, -1, false, true)],
        ));
        for id in 1..=rows {
            source.insert(&table, vec![Some(id.to_string())]).unwrap();
        }

        source
    }

    fn config(tables: &[&str]) -> Arc<SnapshotConfig> {
        let mut config = SnapshotConfig::new(
            "orders_slot",
            SnapshotMode::Initial,
            tables.iter().map(|t| t.to_string()).collect(),
        );
        config.chunk_size = 10;

        Arc::new(config)
    }

    #[tokio::test]
    async fn planning_stores_every_chunk_and_fences_first() {
        let source = source_with_table(95);
        let store = MemoryMetadataStore::new();
        let planner = SnapshotPlanner::new(config(&["orders"]), source.clone(), store.clone());

        let job = planner.plan().await.unwrap();

        assert_eq!(job.status, JobStatus::Exporting);
        assert_eq!(job.fence_lsn, source.current_lsn().await.unwrap());
        assert_eq!(store.job_chunks(job.id).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn equivalent_table_names_are_planned_once() {
        let source = source_with_table(50);
        let store = MemoryMetadataStore::new();
        let planner = SnapshotPlanner::new(
            config(&["orders", " public.orders", "public.orders"]),
            source,
            store.clone(),
        );

        let job = planner.plan().await.unwrap();

        let chunks = store.job_chunks(job.id).await.unwrap();
        assert_eq!(chunks.len(), 5);
        assert!(
            chunks
                .iter()
                .all(|chunk| chunk.table == TableName::new("public", "orders"))
        );
    }

    #[tokio::test]
    async fn introspection_failure_fails_the_job() {
        let source = source_with_table(10);
        let store = MemoryMetadataStore::new();
        let planner = SnapshotPlanner::new(
            config(&["orders", "public.missing"]),
            source,
            store.clone(),
        );

        let err = planner.plan().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PlanningFailed);

        let job = store.latest_job("orders_slot").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(store.job_chunks(job.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn a_live_job_blocks_planning() {
        let source = source_with_table(10);
        let store = MemoryMetadataStore::new();
        let planner = SnapshotPlanner::new(config(&["orders"]), source, store.clone());

        planner.plan().await.unwrap();
        let err = planner.plan().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::LiveJobExists);
        assert_eq!(store.jobs("orders_slot").await.len(), 1);
    }
}
