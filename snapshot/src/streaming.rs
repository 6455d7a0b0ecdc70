//! Hand-off from the snapshot to steady-state streaming.
//!
//! Streaming resumes at the fence position captured before the snapshot started. Changes below
//! the fence are already part of the snapshot and are dropped, and acknowledgements of snapshot
//! events never move the durable replay position.

use std::future::Future;
use tokio_postgres::types::PgLsn;
use tracing::debug;

use crate::error::SnapshotResult;
use crate::types::Event;

/// The change streaming transport that takes over once the snapshot completed.
pub trait StreamingLayer {
    /// Starts streaming changes committed at or after `fence_lsn`.
    fn start_at(&self, fence_lsn: PgLsn) -> impl Future<Output = SnapshotResult<()>> + Send;
}

/// Drops change events the snapshot already covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FencedChangeFilter {
    fence_lsn: PgLsn,
}

impl FencedChangeFilter {
    pub fn new(fence_lsn: PgLsn) -> Self {
        Self { fence_lsn }
    }

    /// Snapshot events always pass. Change events pass when committed at or after the fence.
    pub fn admit(&self, event: &Event) -> bool {
        match event.replay_lsn() {
            Some(commit_lsn) => commit_lsn >= self.fence_lsn,
            None => true,
        }
    }

    pub fn filter(&self, events: Vec<Event>) -> Vec<Event> {
        let before = events.len();
        let events = events
            .into_iter()
            .filter(|event| self.admit(event))
            .collect::<Vec<_>>();

        if events.len() < before {
            debug!(
                fence_lsn = %self.fence_lsn,
                dropped = before - events.len(),
                "dropped changes below the snapshot fence"
            );
        }

        events
    }
}

/// Durable replay position, advanced by acknowledged change events only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayCursor {
    position: PgLsn,
}

impl ReplayCursor {
    /// Starts at the fence of the completed snapshot.
    pub fn new(fence_lsn: PgLsn) -> Self {
        Self {
            position: fence_lsn,
        }
    }

    /// Acknowledges a delivered event. Returns `true` if the position moved.
    pub fn ack(&mut self, event: &Event) -> bool {
        match event.replay_lsn() {
            Some(commit_lsn) if commit_lsn > self.position => {
                self.position = commit_lsn;
                true
            }
            _ => false,
        }
    }

    pub fn position(&self) -> PgLsn {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        ChunkEndEvent, DeleteEvent, InsertEvent, SnapshotDataEvent, TableName, TableRow,
    };

    fn table() -> TableName {
        TableName::new("public", "orders")
    }

    fn insert(lsn: u64) -> Event {
        Event::Insert(InsertEvent {
            commit_lsn: PgLsn::from(lsn),
            table: table(),
            row: TableRow::new(vec![Some(lsn.to_string())]),
        })
    }

    fn data(fence: u64) -> Event {
        Event::SnapshotData(SnapshotDataEvent {
            fence_lsn: PgLsn::from(fence),
            chunk_id: 1,
            table: table(),
            row: TableRow::new(vec![Some("1".to_string())]),
        })
    }

    #[test]
    fn changes_below_the_fence_are_dropped() {
        let filter = FencedChangeFilter::new(PgLsn::from(100));
        let delete = Event::Delete(DeleteEvent {
            commit_lsn: PgLsn::from(100),
            table: table(),
            old_row: TableRow::new(vec![Some("1".to_string())]),
        });

        let kept = filter.filter(vec![insert(99), data(100), insert(100), delete, insert(250)]);

        let lsns = kept.iter().map(Event::replay_lsn).collect::<Vec<_>>();
        assert_eq!(
            lsns,
            vec![
                None,
                Some(PgLsn::from(100)),
                Some(PgLsn::from(100)),
                Some(PgLsn::from(250))
            ]
        );
    }

    #[test]
    fn snapshot_acknowledgements_leave_the_position_alone() {
        let mut cursor = ReplayCursor::new(PgLsn::from(100));

        assert!(!cursor.ack(&data(100)));
        assert!(!cursor.ack(&Event::ChunkEnd(ChunkEndEvent {
            chunk_id: 1,
            table: table(),
            row_count: 10,
        })));
        assert_eq!(cursor.position(), PgLsn::from(100));

        assert!(cursor.ack(&insert(140)));
        assert!(!cursor.ack(&insert(120)));
        assert_eq!(cursor.position(), PgLsn::from(140));
    }
}
