// Outbound delivery seam between the engine and live connections.

use std::collections::HashMap;
use std::sync::RwLock;

use tandem_common::protocol::ws::ServerMessage;
use tandem_common::types::ConnectionId;
use tokio::sync::mpsc;

use crate::error::RelayError;

/// Delivers server messages to a single connection.
///
/// `send` must not block: implementations enqueue and return. A failure
/// concerns only that connection.
pub trait Transport: Send + Sync {
    fn send(&self, connection_id: ConnectionId, message: ServerMessage) -> Result<(), RelayError>;
}

/// Transport backed by one unbounded channel per connection. The receiving
/// half is drained by the socket task that owns the connection.
#[derive(Debug, Default)]
pub struct ChannelTransport {
    outbound: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<ServerMessage>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and return the receiver its socket task drains.
    pub fn register(&self, connection_id: ConnectionId) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.outbound
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(connection_id, sender);
        receiver
    }

    pub fn unregister(&self, connection_id: ConnectionId) -> bool {
        self.outbound
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&connection_id)
            .is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.outbound.read().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}

impl Transport for ChannelTransport {
    fn send(&self, connection_id: ConnectionId, message: ServerMessage) -> Result<(), RelayError> {
        let sender = self
            .outbound
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&connection_id)
            .cloned()
            .ok_or(RelayError::UnknownConnection(connection_id))?;
        sender.send(message).map_err(|_| RelayError::ConnectionClosed(connection_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_common::types::DocumentId;
    use uuid::Uuid;

    fn left(user: &str) -> ServerMessage {
        ServerMessage::AwarenessRemoved {
            document_id: DocumentId::from("ws1:main.py"),
            user_id: user.into(),
        }
    }

    #[tokio::test]
    async fn registered_connection_receives_messages_in_order() {
        let transport = ChannelTransport::new();
        let conn = Uuid::new_v4();
        let mut rx = transport.register(conn);

        transport.send(conn, left("alice")).unwrap();
        transport.send(conn, left("bob")).unwrap();

        assert_eq!(rx.recv().await, Some(left("alice")));
        assert_eq!(rx.recv().await, Some(left("bob")));
    }

    #[test]
    fn unknown_and_closed_connections_fail_independently() {
        let transport = ChannelTransport::new();
        let (open, closed) = (Uuid::new_v4(), Uuid::new_v4());
        let _open_rx = transport.register(open);
        drop(transport.register(closed));

        assert_eq!(
            transport.send(Uuid::nil(), left("a")),
            Err(RelayError::UnknownConnection(Uuid::nil()))
        );
        assert_eq!(transport.send(closed, left("a")), Err(RelayError::ConnectionClosed(closed)));
        assert!(transport.send(open, left("a")).is_ok());

        assert!(transport.unregister(closed));
        assert_eq!(transport.connection_count(), 1);
    }
}
