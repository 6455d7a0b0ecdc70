use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::shared::{RetryConfig, ValidationError};

/// What an instance does with the initial snapshot before streaming starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotMode {
    /// Take the snapshot once, then hand off to streaming at the fence position.
    Initial,
    /// Take the snapshot and stop without streaming.
    SnapshotOnly,
    /// Skip the snapshot entirely.
    Never,
}

impl SnapshotMode {
    pub fn takes_snapshot(&self) -> bool {
        !matches!(self, Self::Never)
    }

    pub fn streams_after_snapshot(&self) -> bool {
        matches!(self, Self::Initial)
    }
}

/// Settings of the parallel initial snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SnapshotConfig {
    /// Identifier of the logical replication endpoint the snapshot belongs to.
    ///
    /// All instances configured with the same endpoint cooperate on one snapshot job.
    pub endpoint: String,
    pub mode: SnapshotMode,
    /// Tables to snapshot, as `schema.table` or `table` for the `public` schema.
    #[serde(default)]
    pub tables: Vec<String>,
    /// Target number of rows per chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// A claim whose heartbeat is older than this is considered abandoned.
    #[serde(default = "default_claim_timeout_ms")]
    pub claim_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Interval at which an instance re-checks job progress once it has nothing to claim.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Chunk workers run concurrently by each instance.
    #[serde(default = "default_max_chunk_workers")]
    pub max_chunk_workers: u16,
    /// Claims a chunk may go through before the job is declared failed.
    #[serde(default = "default_max_chunk_attempts")]
    pub max_chunk_attempts: u32,
    /// Snapshot jobs an instance starts or joins before giving up.
    #[serde(default = "default_max_job_attempts")]
    pub max_job_attempts: u32,
    /// Backoff applied to transient metadata store failures.
    #[serde(default)]
    pub store_retry: RetryConfig,
}

fn default_chunk_size() -> u64 {
    10_000
}

fn default_claim_timeout_ms() -> u64 {
    30_000
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_max_chunk_workers() -> u16 {
    4
}

fn default_max_chunk_attempts() -> u32 {
    5
}

fn default_max_job_attempts() -> u32 {
    3
}

impl SnapshotConfig {
    /// Config with default tuning for the given endpoint and tables.
    pub fn new(endpoint: impl Into<String>, mode: SnapshotMode, tables: Vec<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            mode,
            tables,
            chunk_size: default_chunk_size(),
            claim_timeout_ms: default_claim_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            max_chunk_workers: default_max_chunk_workers(),
            max_chunk_attempts: default_max_chunk_attempts(),
            max_job_attempts: default_max_job_attempts(),
            store_retry: RetryConfig::default(),
        }
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.endpoint.trim().is_empty() {
            return Err(ValidationError::EmptyEndpoint);
        }

        if self.mode.takes_snapshot() && self.tables.is_empty() {
            return Err(ValidationError::NoTables);
        }

        let mut seen = HashSet::new();
        for table in &self.tables {
            let qualified = qualified_table_name(table);
            if !seen.insert(qualified.clone()) {
                return Err(ValidationError::DuplicateTable(qualified));
            }
        }

        if self.chunk_size == 0 {
            return Err(ValidationError::ChunkSizeZero);
        }

        if self.max_chunk_workers == 0 {
            return Err(ValidationError::MaxChunkWorkersZero);
        }

        if self.max_chunk_attempts == 0 {
            return Err(ValidationError::MaxChunkAttemptsZero);
        }

        if self.max_job_attempts == 0 {
            return Err(ValidationError::MaxJobAttemptsZero);
        }

        if self.heartbeat_interval_ms >= self.claim_timeout_ms {
            return Err(ValidationError::HeartbeatNotBelowClaimTimeout {
                heartbeat_interval_ms: self.heartbeat_interval_ms,
                claim_timeout_ms: self.claim_timeout_ms,
            });
        }

        self.store_retry.validate()
    }
}

/// Spells a configured table as `schema.table`, defaulting to the `public` schema.
fn qualified_table_name(table: &str) -> String {
    let table = table.trim();
    match table.split_once('.') {
        Some((schema, name)) => format!("{}.{}", schema.trim(), name.trim()),
        None => format!("public.{table}"),
    }
}
