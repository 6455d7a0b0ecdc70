use tokio::sync::watch;

/// Sending half of a watch channel carrying no value, only the fact that it fired.
pub type SignalTx = watch::Sender<()>;

/// Receiving half of a watch channel carrying no value.
pub type SignalRx = watch::Receiver<()>;

pub fn create_signal() -> (SignalTx, SignalRx) {
    watch::channel(())
}
