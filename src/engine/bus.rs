//! Bounded update channel from the engine to the UI.
//!
//! Capacity 100 with drop-newest-on-full semantics: a stalled consumer
//! can miss intermediate updates but never blocks the cycle loop and
//! never sees updates out of order. The channel closes exactly once when
//! the engine's loop task drops its bus.

use tokio::sync::mpsc;

use super::CycleUpdate;

/// Channel capacity.
pub const UPDATE_BUS_CAPACITY: usize = 100;

/// Producer side of the update channel.
#[derive(Debug, Clone)]
pub struct UpdateBus {
    tx: mpsc::Sender<CycleUpdate>,
}

impl UpdateBus {
    /// Create a bus and its consumer end.
    #[must_use]
    pub fn new() -> (Self, mpsc::Receiver<CycleUpdate>) {
        let (tx, rx) = mpsc::channel(UPDATE_BUS_CAPACITY);
        (Self { tx }, rx)
    }

    /// Send an update without blocking. When the channel is full the new
    /// update is dropped; when the consumer is gone the send is a no-op.
    pub fn send(&self, update: CycleUpdate) {
        let _ = self.tx.try_send(update);
    }
}
