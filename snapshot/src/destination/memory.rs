use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::destination::base::Destination;
use crate::error::SnapshotResult;
use crate::types::{Event, EventType, SnapshotDataEvent};

#[derive(Debug, Default)]
struct Inner {
    events: Vec<Event>,
}

/// Destination keeping every event in memory, shared between clones.
#[derive(Debug, Clone, Default)]
pub struct MemoryDestination {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<Event> {
        self.inner.lock().await.events.clone()
    }

    pub async fn events_of_type(&self, event_type: EventType) -> Vec<Event> {
        self.inner
            .lock()
            .await
            .events
            .iter()
            .filter(|event| event.event_type() == event_type)
            .cloned()
            .collect()
    }

    /// Returns the rows delivered by the snapshot.
    pub async fn snapshot_rows(&self) -> Vec<SnapshotDataEvent> {
        self.inner
            .lock()
            .await
            .events
            .iter()
            .filter_map(|event| match event {
                Event::SnapshotData(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn clear(&self) {
        self.inner.lock().await.events.clear();
    }
}

impl Destination for MemoryDestination {
    async fn write_events(&self, events: Vec<Event>) -> SnapshotResult<()> {
        let mut inner = self.inner.lock().await;
        debug!("writing a batch of {} events", events.len());
        inner.events.extend(events);

        Ok(())
    }
}
