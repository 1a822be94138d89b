//! Gateway events for downstream consumers

use tokio::sync::broadcast;

use crate::device::{DeviceId, IeeeAddress};

/// Notification emitted by the gateway core
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// Node announced itself on the network
    NodeJoined(IeeeAddress),
    /// Node left the network and was removed
    NodeLeft(IeeeAddress),
    /// Device added to the registry
    DeviceAdded(DeviceId),
    /// Device removed from the registry
    DeviceRemoved(DeviceId),
    /// Enumeration of a node started
    EnumerationStarted(IeeeAddress),
    /// Enumeration completed for a device
    EnumerationSucceeded(DeviceId),
    /// Descriptor discovery failed; `device` is absent if the node hosts none
    EnumerationFailed {
        node: IeeeAddress,
        device: Option<DeviceId>,
        error: String,
    },
}

/// Fire-and-forget event sink backed by a broadcast channel
#[derive(Debug, Clone)]
pub struct Events {
    tx: broadcast::Sender<GatewayEvent>,
}

impl Events {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Send an event; having no subscribers is not an error
    pub fn send(&self, event: GatewayEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }
}

impl Default for Events {
    fn default() -> Self {
        Self::new(100)
    }
}
