use std::future::Future;

use crate::error::SnapshotResult;
use crate::types::Event;

/// Receives snapshot and change events.
///
/// Delivery is at least once: a chunk whose claim is lost after its rows were written is read and
/// written again by the next claimer.
pub trait Destination {
    fn write_events(&self, events: Vec<Event>) -> impl Future<Output = SnapshotResult<()>> + Send;
}
