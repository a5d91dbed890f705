use std::collections::HashMap;

use beamdrop_protocol::ServerEvent;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::debug;

pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

#[derive(Default)]
struct Inner {
    by_socket: HashMap<String, EventSender>,
    // client -> socket ids, oldest first; a reconnect appends a fresh socket
    by_client: HashMap<String, Vec<String>>,
}

/// Active socket bindings on this node. The gateway binds a sender per
/// connection; the coordinator's local fast path and `message:route`
/// consumption resolve through here.
#[derive(Default)]
pub struct SocketRegistry {
    inner: RwLock<Inner>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn bind_socket(&self, socket_id: &str, sender: EventSender) {
        let mut inner = self.inner.write().await;
        inner.by_socket.insert(socket_id.to_string(), sender);
    }

    /// Associates a registered client id with an already-bound socket.
    pub async fn bind_client(&self, client_id: &str, socket_id: &str) {
        let mut inner = self.inner.write().await;
        let sockets = inner.by_client.entry(client_id.to_string()).or_default();
        if !sockets.iter().any(|s| s == socket_id) {
            sockets.push(socket_id.to_string());
        }
    }

    /// Drops the socket binding and returns the client ids left without any
    /// live socket on this node.
    pub async fn unbind_socket(&self, socket_id: &str) -> Vec<String> {
        let mut inner = self.inner.write().await;
        inner.by_socket.remove(socket_id);
        let mut orphaned = Vec::new();
        inner.by_client.retain(|client_id, sockets| {
            sockets.retain(|s| s != socket_id);
            if sockets.is_empty() {
                orphaned.push(client_id.clone());
                false
            } else {
                true
            }
        });
        orphaned
    }

    pub async fn send_to_socket(&self, socket_id: &str, event: ServerEvent) -> bool {
        let inner = self.inner.read().await;
        match inner.by_socket.get(socket_id) {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Delivers to the newest live socket of the client. Sockets whose
    /// receiver has gone away are skipped; cleanup happens on unbind.
    pub async fn send_to_client(&self, client_id: &str, event: ServerEvent) -> bool {
        let inner = self.inner.read().await;
        let Some(sockets) = inner.by_client.get(client_id) else {
            return false;
        };
        for socket_id in sockets.iter().rev() {
            if let Some(sender) = inner.by_socket.get(socket_id) {
                if sender.send(event.clone()).is_ok() {
                    return true;
                }
                debug!(socket_id, client_id, "socket sender closed, trying older binding");
            }
        }
        false
    }

    /// Broadcast to every bound socket, e.g. for cluster role changes.
    pub async fn broadcast(&self, event: ServerEvent) {
        let inner = self.inner.read().await;
        for sender in inner.by_socket.values() {
            let _ = sender.send(event.clone());
        }
    }

    pub async fn has_client(&self, client_id: &str) -> bool {
        let inner = self.inner.read().await;
        inner
            .by_client
            .get(client_id)
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    }

    pub async fn socket_count(&self) -> usize {
        self.inner.read().await.by_socket.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (EventSender, mpsc::UnboundedReceiver<ServerEvent>) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn delivers_to_newest_socket_of_client() {
        let registry = SocketRegistry::new();
        let (tx_old, mut rx_old) = channel();
        let (tx_new, mut rx_new) = channel();
        registry.bind_socket("s1", tx_old).await;
        registry.bind_client("alice", "s1").await;
        registry.bind_socket("s2", tx_new).await;
        registry.bind_client("alice", "s2").await;

        assert!(
            registry
                .send_to_client("alice", ServerEvent::HeartbeatAck { timestamp_ms: 1 })
                .await
        );
        assert!(rx_new.try_recv().is_ok());
        assert!(rx_old.try_recv().is_err());
    }

    #[tokio::test]
    async fn unbind_reports_orphaned_clients() {
        let registry = SocketRegistry::new();
        let (tx, _rx) = channel();
        registry.bind_socket("s1", tx).await;
        registry.bind_client("alice", "s1").await;
        let orphaned = registry.unbind_socket("s1").await;
        assert_eq!(orphaned, vec!["alice".to_string()]);
        assert!(!registry.has_client("alice").await);
    }

    #[tokio::test]
    async fn falls_back_to_older_socket_when_newest_closed() {
        let registry = SocketRegistry::new();
        let (tx_old, mut rx_old) = channel();
        let (tx_new, rx_new) = channel();
        registry.bind_socket("s1", tx_old).await;
        registry.bind_client("alice", "s1").await;
        registry.bind_socket("s2", tx_new).await;
        registry.bind_client("alice", "s2").await;
        drop(rx_new);

        assert!(
            registry
                .send_to_client("alice", ServerEvent::HeartbeatAck { timestamp_ms: 2 })
                .await
        );
        assert!(rx_old.try_recv().is_ok());
    }
}
