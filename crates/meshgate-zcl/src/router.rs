//! Inbound message routing
//!
//! Listeners are (filter, handler) pairs kept in registration order. Each
//! inbound message is offered to every filter and the handlers of all
//! matching listeners run synchronously, in order, on the dispatching task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::trace;

use crate::message::ZclMessage;

type Filter = Box<dyn Fn(&ZclMessage) -> bool + Send + Sync>;
type Handler = Box<dyn Fn(&ZclMessage) + Send + Sync>;

struct Listener {
    filter: Filter,
    handler: Handler,
}

/// Handle returned by [`MessageRouter::listen`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordered registry of inbound-message subscriptions
#[derive(Default)]
pub struct MessageRouter {
    listeners: RwLock<Vec<(ListenerId, Arc<Listener>)>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("listeners", &self.len())
            .finish()
    }
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a persistent subscription
    pub fn listen<F, H>(&self, filter: F, handler: H) -> ListenerId
    where
        F: Fn(&ZclMessage) -> bool + Send + Sync + 'static,
        H: Fn(&ZclMessage) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let listener = Arc::new(Listener {
            filter: Box::new(filter),
            handler: Box::new(handler),
        });
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Remove a subscription, returns false if it was not registered
    pub fn unlisten(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Offer a message to every listener; returns how many handlers ran
    pub fn dispatch(&self, message: &ZclMessage) -> usize {
        // Handlers run without the lock held so they may (un)register listeners
        let matching: Vec<Arc<Listener>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, listener)| (listener.filter)(message))
            .map(|(_, listener)| listener.clone())
            .collect();

        trace!(
            source = %message.source,
            cluster = message.cluster,
            matched = matching.len(),
            "Dispatching inbound message"
        );

        for listener in &matching {
            (listener.handler)(message);
        }
        matching.len()
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ZclCommand;
    use crate::types::Direction;
    use meshgate_core::IeeeAddress;
    use std::sync::Mutex;

    fn message(cluster: u16) -> ZclMessage {
        ZclMessage {
            source: IeeeAddress(1),
            source_endpoint: 1,
            destination_endpoint: 1,
            cluster,
            direction: Direction::ServerToClient,
            transaction_sequence: 0,
            manufacturer_code: None,
            command: ZclCommand::ReportAttributes(Vec::new()),
        }
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let router = MessageRouter::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let calls = calls.clone();
            router.listen(|m| m.cluster == 6, move |_| calls.lock().unwrap().push(tag));
        }
        let other = calls.clone();
        router.listen(|m| m.cluster == 8, move |_| other.lock().unwrap().push("level"));

        assert_eq!(router.dispatch(&message(6)), 2);
        assert_eq!(*calls.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_unlisten() {
        let router = MessageRouter::new();
        let id = router.listen(|_| true, |_| {});
        assert_eq!(router.len(), 1);
        assert!(router.unlisten(id));
        assert!(!router.unlisten(id));
        assert!(router.is_empty());
        assert_eq!(router.dispatch(&message(6)), 0);
    }
}
