//! Chunk workers and the pool running them.
//!
//! A chunk worker claims one chunk at a time, keeps its claim alive with a heartbeat task while
//! reading it from the exported view and delivers its rows to the destination.

pub mod chunk;
pub mod heartbeat;
pub mod pool;
