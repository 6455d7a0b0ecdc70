use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snapshot_postgres::schema::TableName;
use std::fmt;

use crate::types::{JobId, WorkerId};

/// Identifier of a chunk, unique across jobs.
pub type ChunkId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::InProgress => "in_progress",
            ChunkStatus::Completed => "completed",
            ChunkStatus::Failed => "failed",
        };

        f.write_str(status)
    }
}

/// The slice of a table covered by a chunk.
///
/// Both variants are half-open: `start` is included, `end` excluded. A missing bound is
/// unbounded, which lets the first and last chunk of a table absorb rows whose keys fall outside
/// the range observed while planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChunkBounds {
    /// Row offsets in the order given by [`Chunk::order_by`].
    Offset { start: i64, end: Option<i64> },
    /// Values of the single integer primary key column.
    Range { start: Option<i64>, end: Option<i64> },
}

impl ChunkBounds {
    /// Returns `true` if a key (for ranges) or an offset (for offsets) falls inside the bounds.
    pub fn contains(&self, position: i64) -> bool {
        let (start, end) = match *self {
            ChunkBounds::Offset { start, end } => (Some(start), end),
            ChunkBounds::Range { start, end } => (start, end),
        };

        start.is_none_or(|start| position >= start) && end.is_none_or(|end| position < end)
    }

    /// Number of rows an offset chunk reads, `None` when unbounded or for ranges.
    pub fn limit(&self) -> Option<i64> {
        match *self {
            ChunkBounds::Offset { start, end } => end.map(|end| end - start),
            ChunkBounds::Range { .. } => None,
        }
    }
}

impl fmt::Display for ChunkBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn bound(value: Option<i64>) -> String {
            value.map_or_else(|| "*".to_string(), |v| v.to_string())
        }

        match *self {
            ChunkBounds::Offset { start, end } => write!(f, "offset [{start}, {})", bound(end)),
            ChunkBounds::Range { start, end } => {
                write!(f, "range [{}, {})", bound(start), bound(end))
            }
        }
    }
}

/// A chunk as produced by planning, before it is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    pub table: TableName,
    /// Columns establishing the row order inside the chunk. For range chunks this is the key
    /// column alone.
    pub order_by: Vec<String>,
    pub bounds: ChunkBounds,
}

/// A persisted unit of snapshot work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: ChunkId,
    pub job_id: JobId,
    pub table: TableName,
    pub order_by: Vec<String>,
    pub bounds: ChunkBounds,
    pub status: ChunkStatus,
    pub claimed_by: Option<WorkerId>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Number of times the chunk has been claimed.
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Result of a stale claim sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimOutcome {
    /// Chunks returned to `pending`.
    pub reclaimed: u64,
    /// Chunks marked `failed` because they used up their attempts.
    pub exhausted: u64,
}
