use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use snapshot_postgres::schema::TableName;
use tokio_postgres::types::PgLsn;

use crate::types::{ChunkBounds, ChunkId, JobId, TableRow};

fn serialize_lsn<S: Serializer>(lsn: &PgLsn, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(lsn)
}

/// Opens the snapshot of a job. Emitted once, after the consistent view is exported.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotBeginEvent {
    pub job_id: JobId,
    #[serde(serialize_with = "serialize_lsn")]
    pub fence_lsn: PgLsn,
    pub time: DateTime<Utc>,
}

/// Opens the rows of one chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkBeginEvent {
    pub chunk_id: ChunkId,
    pub table: TableName,
    pub bounds: ChunkBounds,
    #[serde(serialize_with = "serialize_lsn")]
    pub fence_lsn: PgLsn,
}

/// A row read from the consistent view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotDataEvent {
    #[serde(serialize_with = "serialize_lsn")]
    pub fence_lsn: PgLsn,
    pub chunk_id: ChunkId,
    pub table: TableName,
    pub row: TableRow,
}

/// Closes the rows of one chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkEndEvent {
    pub chunk_id: ChunkId,
    pub table: TableName,
    pub row_count: u64,
}

/// Closes the snapshot of a job. Emitted once, after every chunk completed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotEndEvent {
    pub job_id: JobId,
    #[serde(serialize_with = "serialize_lsn")]
    pub fence_lsn: PgLsn,
    pub time: DateTime<Utc>,
}

/// A row inserted after the snapshot, delivered by the streaming layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsertEvent {
    #[serde(serialize_with = "serialize_lsn")]
    pub commit_lsn: PgLsn,
    pub table: TableName,
    pub row: TableRow,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateEvent {
    #[serde(serialize_with = "serialize_lsn")]
    pub commit_lsn: PgLsn,
    pub table: TableName,
    pub row: TableRow,
    /// Previous row image, when the replica identity provides one.
    pub old_row: Option<TableRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeleteEvent {
    #[serde(serialize_with = "serialize_lsn")]
    pub commit_lsn: PgLsn,
    pub table: TableName,
    pub old_row: TableRow,
}

/// Everything handed to a destination.
///
/// Snapshot events are bracketed by a single [`Event::SnapshotBegin`] / [`Event::SnapshotEnd`]
/// pair per job, and the rows of each chunk by [`Event::ChunkBegin`] / [`Event::ChunkEnd`].
/// Change events follow once streaming started at the fence position.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    SnapshotBegin(SnapshotBeginEvent),
    ChunkBegin(ChunkBeginEvent),
    SnapshotData(SnapshotDataEvent),
    ChunkEnd(ChunkEndEvent),
    SnapshotEnd(SnapshotEndEvent),
    Insert(InsertEvent),
    Update(UpdateEvent),
    Delete(DeleteEvent),
}

impl Event {
    pub fn event_type(&self) -> EventType {
        self.into()
    }

    /// Log position an acknowledgement of this event advances the replay position to.
    ///
    /// Snapshot events carry no replay position: acknowledging them must never move the
    /// streaming position.
    pub fn replay_lsn(&self) -> Option<PgLsn> {
        match self {
            Event::Insert(event) => Some(event.commit_lsn),
            Event::Update(event) => Some(event.commit_lsn),
            Event::Delete(event) => Some(event.commit_lsn),
            Event::SnapshotBegin(_)
            | Event::ChunkBegin(_)
            | Event::SnapshotData(_)
            | Event::ChunkEnd(_)
            | Event::SnapshotEnd(_) => None,
        }
    }

    pub fn is_snapshot_event(&self) -> bool {
        self.event_type().is_snapshot()
    }

    pub fn table(&self) -> Option<&TableName> {
        match self {
            Event::ChunkBegin(event) => Some(&event.table),
            Event::SnapshotData(event) => Some(&event.table),
            Event::ChunkEnd(event) => Some(&event.table),
            Event::Insert(event) => Some(&event.table),
            Event::Update(event) => Some(&event.table),
            Event::Delete(event) => Some(&event.table),
            Event::SnapshotBegin(_) | Event::SnapshotEnd(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    SnapshotBegin,
    ChunkBegin,
    SnapshotData,
    ChunkEnd,
    SnapshotEnd,
    Insert,
    Update,
    Delete,
}

impl EventType {
    pub fn is_snapshot(&self) -> bool {
        matches!(
            self,
            EventType::SnapshotBegin
                | EventType::ChunkBegin
                | EventType::SnapshotData
                | EventType::ChunkEnd
                | EventType::SnapshotEnd
        )
    }
}

impl From<&Event> for EventType {
    fn from(event: &Event) -> Self {
        match event {
            Event::SnapshotBegin(_) => EventType::SnapshotBegin,
            Event::ChunkBegin(_) => EventType::ChunkBegin,
            Event::SnapshotData(_) => EventType::SnapshotData,
            Event::ChunkEnd(_) => EventType::ChunkEnd,
            Event::SnapshotEnd(_) => EventType::SnapshotEnd,
            Event::Insert(_) => EventType::Insert,
            Event::Update(_) => EventType::Update,
            Event::Delete(_) => EventType::Delete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableName {
        TableName::new("public", "orders")
    }

    #[test]
    fn snapshot_events_carry_no_replay_position() {
        let data = Event::SnapshotData(SnapshotDataEvent {
            fence_lsn: PgLsn::from(100),
            chunk_id: 1,
            table: table(),
            row: TableRow::new(vec![Some("1".to_string())]),
        });
        assert_eq!(data.replay_lsn(), None);
        assert!(data.is_snapshot_event());

        let insert = Event::Insert(InsertEvent {
            commit_lsn: PgLsn::from(150),
            table: table(),
            row: TableRow::new(vec![Some("2".to_string())]),
        });
        assert_eq!(insert.replay_lsn(), Some(PgLsn::from(150)));
        assert!(!insert.is_snapshot_event());
    }

    #[test]
    fn events_serialize_with_textual_lsns() {
        let event = Event::SnapshotBegin(SnapshotBeginEvent {
            job_id: 7,
            fence_lsn: PgLsn::from(0x1_0000_0010),
            time: DateTime::<Utc>::UNIX_EPOCH,
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "snapshot_begin");
        assert_eq!(json["fence_lsn"], "1/10");
        assert_eq!(json["job_id"], 7);
    }
}
