//! Connection Registry
//!
//! Tracks which sockets belong to which user. A user may hold several
//! connections at once; events addressed to a user fan out to all of them.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::protocol::ServerEvent;

pub type ConnectionId = Uuid;

/// Sending half of one client connection. Cheap to clone; delivery is a
/// non-blocking enqueue so no producer ever waits on a slow socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user_id: Uuid,
    pub username: String,
    outbound: mpsc::Sender<ServerEvent>,
}

impl ConnectionHandle {
    pub fn new(
        user_id: Uuid,
        username: String,
        outbound: mpsc::Sender<ServerEvent>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            username,
            outbound,
        }
    }

    /// Enqueue an event; returns false when the connection is gone or its
    /// queue is full, in which case the caller should drop the subscriber
    pub fn send(&self, event: ServerEvent) -> bool {
        self.outbound.try_send(event).is_ok()
    }
}

/// Per-user index of live connections
#[derive(Default)]
pub struct ConnectionRegistry {
    by_user: Mutex<HashMap<Uuid, Vec<ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: ConnectionHandle) {
        let mut by_user = self.by_user.lock();
        by_user.entry(handle.user_id).or_default().push(handle);
    }

    pub fn unregister(&self, user_id: Uuid, connection_id: ConnectionId) {
        let mut by_user = self.by_user.lock();
        if let Some(connections) = by_user.get_mut(&user_id) {
            connections.retain(|c| c.id != connection_id);
            if connections.is_empty() {
                by_user.remove(&user_id);
            }
        }
        debug!(%user_id, %connection_id, "connection unregistered");
    }

    /// Deliver an event to every active connection of a user
    pub fn send_to_user(&self, user_id: Uuid, event: &ServerEvent) {
        let by_user = self.by_user.lock();
        if let Some(connections) = by_user.get(&user_id) {
            for connection in connections {
                connection.send(event.clone());
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.by_user.lock().values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(user_id: Uuid) -> (ConnectionHandle, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(8);
        (ConnectionHandle::new(user_id, "user".to_string(), tx), rx)
    }

    #[tokio::test]
    async fn delivers_to_every_connection_of_a_user() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let (first, mut rx1) = handle(user);
        let (second, mut rx2) = handle(user);
        registry.register(first);
        registry.register(second);

        registry.send_to_user(
            user,
            &ServerEvent::Error {
                message: "ping".to_string(),
            },
        );
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert_eq!(registry.connection_count(), 2);
    }

    #[tokio::test]
    async fn unregister_removes_only_that_connection() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let (first, _rx1) = handle(user);
        let (second, mut rx2) = handle(user);
        let first_id = first.id;
        registry.register(first);
        registry.register(second);

        registry.unregister(user, first_id);
        registry.send_to_user(
            user,
            &ServerEvent::Error {
                message: "still here".to_string(),
            },
        );
        assert!(rx2.try_recv().is_ok());
        assert_eq!(registry.connection_count(), 1);
    }
}
