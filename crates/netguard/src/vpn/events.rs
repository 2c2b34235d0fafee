//! Session lifecycle notifications.

use tokio::sync::broadcast;

use super::manager::{NetworkHandle, SessionState};

/// Events published by the session manager. Consumers subscribe
/// independently; the manager never blocks on a slow receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VpnEvent {
    StateChanged(SessionState),
    NetworkAvailable(NetworkHandle),
    CapabilitiesChanged {
        network: NetworkHandle,
        validated: bool,
    },
    NetworkLost(NetworkHandle),
    NegotiationFailed {
        cause: String,
    },
}

/// Broadcast bus carrying [`VpnEvent`]s.
#[derive(Clone)]
pub struct VpnEventBus {
    sender: broadcast::Sender<VpnEvent>,
}

impl VpnEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VpnEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: VpnEvent) {
        let _ = self.sender.send(event);
    }
}
