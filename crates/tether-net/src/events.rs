//! Connection lifecycle events.

use std::net::SocketAddr;

use tether_core::{CloseReason, ConnectionId};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// A connection came up or went away.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Registered. Always published before the connection's `Closed`.
    Established {
        /// The new connection.
        id: ConnectionId,
        /// Remote address, when the transport has one.
        peer: Option<SocketAddr>,
    },
    /// Removed from the registry.
    Closed {
        /// The closed connection.
        id: ConnectionId,
        /// Why it closed.
        reason: CloseReason,
    },
}

impl ConnectionEvent {
    /// The connection this event is about.
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            Self::Established { id, .. } | Self::Closed { id, .. } => *id,
        }
    }
}

/// Fan-out of [`ConnectionEvent`]s to any number of subscribers.
///
/// Slow subscribers lag and lose the oldest events; emitters never block.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<ConnectionEvent>,
}

impl EventBus {
    /// Create a bus with the default buffer.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Receive events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Returns the number of subscribers reached.
    pub fn emit(&self, event: ConnectionEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Current subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let id = ConnectionId::from_raw(1);
        assert_eq!(bus.emit(ConnectionEvent::Established { id, peer: None }), 1);
        let _ = bus.emit(ConnectionEvent::Closed {
            id,
            reason: CloseReason::PeerClosed,
        });
        assert_eq!(rx.recv().await.unwrap(), ConnectionEvent::Established { id, peer: None });
        assert_eq!(
            rx.recv().await.unwrap(),
            ConnectionEvent::Closed {
                id,
                reason: CloseReason::PeerClosed
            }
        );
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(
            bus.emit(ConnectionEvent::Established {
                id: ConnectionId::from_raw(2),
                peer: None
            }),
            0
        );
    }

    #[test]
    fn event_connection_id() {
        let id = ConnectionId::from_raw(9);
        let ev = ConnectionEvent::Closed {
            id,
            reason: CloseReason::Local,
        };
        assert_eq!(ev.connection_id(), id);
    }
}
