use tokio::sync::watch;

use crate::concurrency::signal::{SignalRx, SignalTx, create_signal};

/// Broadcasts the shutdown request to the pipeline and every chunk worker.
#[derive(Debug, Clone)]
pub struct ShutdownTx(SignalTx);

impl ShutdownTx {
    pub fn wrap(tx: SignalTx) -> Self {
        Self(tx)
    }

    pub fn shutdown(&self) -> Result<(), watch::error::SendError<()>> {
        self.0.send(())
    }

    pub fn subscribe(&self) -> ShutdownRx {
        self.0.subscribe()
    }
}

pub type ShutdownRx = SignalRx;

pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = create_signal();
    (ShutdownTx::wrap(tx), rx)
}

/// Returns `true` once a shutdown was requested on `rx`.
///
/// A dropped sender counts as a shutdown request since nobody can stop the receiver anymore.
pub fn is_shutdown_requested(rx: &ShutdownRx) -> bool {
    rx.has_changed().unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_observe_shutdown() {
        let (tx, rx) = create_shutdown_channel();
        let mut late = tx.subscribe();
        assert!(!is_shutdown_requested(&rx));

        tx.shutdown().unwrap();

        assert!(is_shutdown_requested(&rx));
        late.changed().await.unwrap();
    }

    #[test]
    fn dropped_sender_counts_as_shutdown() {
        let (tx, rx) = create_shutdown_channel();
        drop(tx);

        assert!(is_shutdown_requested(&rx));
    }
}
