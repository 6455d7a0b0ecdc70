//! Sinks receiving the events produced by the snapshot.
//!
//! Provides the [`Destination`] trait, an in-memory implementation used by tests and a JSON lines
//! implementation writing to standard output.

mod base;
pub mod memory;
pub mod stdout;

pub use base::Destination;
