//! Parallel initial snapshot for Postgres change data capture.
//!
//! Several instances configured with the same replication endpoint cooperate on one snapshot:
//! an elected coordinator captures the fence position, partitions the configured tables into
//! chunks and exports a consistent view of the database. Every instance then claims chunks, reads
//! them from the exported view and delivers their rows to a destination. Once every chunk is
//! read, streaming resumes at the fence position.
//!
//! The [`pipeline::SnapshotPipeline`] drives the whole process for one instance.

pub mod concurrency;
pub mod destination;
pub mod election;
pub mod error;
pub mod exporter;
pub mod gate;
mod macros;
pub mod pipeline;
pub mod planner;
pub mod recovery;
pub mod source;
pub mod store;
pub mod streaming;
#[cfg(feature = "test-utils")]
pub mod test_utils;
pub mod types;
pub mod utils;
pub mod workers;
