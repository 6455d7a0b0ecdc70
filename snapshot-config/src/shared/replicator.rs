use serde::{Deserialize, Serialize};

use crate::Config;
use crate::shared::{PgConnectionConfig, SnapshotConfig, ValidationError};

/// Configuration of the replicator binary.
///
/// Snapshot metadata lives in the source database itself, so there is no separate store
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ReplicatorConfig {
    /// Source Postgres database.
    pub source: PgConnectionConfig,
    pub snapshot: SnapshotConfig,
}

impl ReplicatorConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.source.validate()?;
        self.snapshot.validate()?;

        Ok(())
    }
}

impl Config for ReplicatorConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &["snapshot.tables"];
}
