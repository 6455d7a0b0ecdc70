use std::sync::Arc;
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::Mutex;

use crate::destination::base::Destination;
use crate::error::SnapshotResult;
use crate::types::Event;

/// Destination printing every event as one JSON object per line.
#[derive(Debug, Clone)]
pub struct StdoutDestination {
    stdout: Arc<Mutex<Stdout>>,
}

impl StdoutDestination {
    pub fn new() -> Self {
        Self {
            stdout: Arc::new(Mutex::new(tokio::io::stdout())),
        }
    }
}

impl Default for StdoutDestination {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializes a batch of events into JSON lines.
fn encode_events(events: &[Event]) -> SnapshotResult<Vec<u8>> {
    let mut buffer = Vec::new();
    for event in events {
        serde_json::to_writer(&mut buffer, event)?;
        buffer.push(b'\n');
    }

    Ok(buffer)
}

impl Destination for StdoutDestination {
    async fn write_events(&self, events: Vec<Event>) -> SnapshotResult<()> {
        let buffer = encode_events(&events)?;

        // A batch is written under the lock so lines of concurrent workers never interleave.
        let mut stdout = self.stdout.lock().await;
        stdout.write_all(&buffer).await?;
        stdout.flush().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChunkEndEvent, TableName};

    #[test]
    fn events_are_encoded_one_per_line() {
        let event = Event::ChunkEnd(ChunkEndEvent {
            chunk_id: 3,
            table: TableName::new("public", "orders"),
            row_count: 100,
        });

        let buffer = encode_events(&[event.clone(), event]).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines = text.lines().collect::<Vec<_>>();

        assert_eq!(lines.len(), 2);
        let json: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(json["type"], "chunk_end");
        assert_eq!(json["row_count"], 100);
        assert_eq!(json["table"]["name"], "orders");
    }
}
