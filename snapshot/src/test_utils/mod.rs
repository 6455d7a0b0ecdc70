//! Helpers for integration tests running against a real Postgres instance.

pub mod database;
