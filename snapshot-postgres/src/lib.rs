//! Postgres schema types shared by the snapshot crates.
//!
//! With the `test-utils` feature it also provides helpers that create throwaway databases for
//! integration tests.

pub mod schema;
#[cfg(feature = "test-utils")]
pub mod tokio;
pub mod types;
