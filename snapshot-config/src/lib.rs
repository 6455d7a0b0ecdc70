//! Configuration for the snapshot coordinator and the replicator binary.
//!
//! Provides environment detection, hierarchical loading from YAML files and environment
//! variables, secret handling and the shared configuration types.

mod environment;
mod load;
mod secret;
pub mod shared;

pub use environment::*;
pub use load::*;
pub use secret::*;
