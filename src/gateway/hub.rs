//! GatewayHub - Operator Connection Fan-out
//!
//! ## Responsibilities
//!
//! - Operator WebSocket connection management
//! - Per-connection lifecycle state
//! - Broadcast of registry/session pushes
//! - Direct replies to a single connection

use super::connection::ConnectionState;
use super::protocol::ServerMessage;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Operator connection
struct ClientConnection {
    id: Uuid,
    state: ConnectionState,
    connected_at: DateTime<Utc>,
    tx: mpsc::UnboundedSender<String>,
}

/// Connection summary for health output
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub state: ConnectionState,
    pub connected_at: DateTime<Utc>,
}

/// GatewayHub instance
pub struct GatewayHub {
    connections: RwLock<HashMap<Uuid, ClientConnection>>,
    connection_count: AtomicU64,
}

impl GatewayHub {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            connection_count: AtomicU64::new(0),
        }
    }

    /// Register a new connection in `Connecting`
    ///
    /// Registration happens before the initial snapshot is taken, so no
    /// change pushed afterwards can be missed.
    pub async fn register(&self) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        let conn = ClientConnection {
            id,
            state: ConnectionState::Connecting,
            connected_at: Utc::now(),
            tx,
        };

        {
            let mut connections = self.connections.write().await;
            connections.insert(id, conn);
        }

        self.connection_count.fetch_add(1, Ordering::Relaxed);
        tracing::info!(connection_id = %id, "Operator client connecting");

        (id, rx)
    }

    pub async fn set_state(&self, id: &Uuid, state: ConnectionState) {
        let mut connections = self.connections.write().await;
        if let Some(conn) = connections.get_mut(id) {
            tracing::debug!(connection_id = %id, from = %conn.state, to = %state, "Connection state");
            conn.state = state;
        }
    }

    pub async fn unregister(&self, id: &Uuid) {
        let mut connections = self.connections.write().await;
        if connections.remove(id).is_some() {
            self.connection_count.fetch_sub(1, Ordering::Relaxed);
            tracing::info!(connection_id = %id, "Operator client disconnected");
        }
    }

    fn encode(message: &ServerMessage) -> Option<String> {
        match serde_json::to_string(message) {
            Ok(json) => Some(json),
            Err(e) => {
                tracing::error!(message_type = message.kind(), error = %e, "Failed to serialize message");
                None
            }
        }
    }

    /// Broadcast to every registered connection
    pub async fn broadcast(&self, message: &ServerMessage) {
        let Some(json) = Self::encode(message) else {
            return;
        };

        let connections = self.connections.read().await;
        tracing::debug!(
            message_type = message.kind(),
            client_count = connections.len(),
            "Broadcasting to operator clients"
        );

        for conn in connections.values() {
            if let Err(e) = conn.tx.send(json.clone()) {
                tracing::warn!(connection_id = %conn.id, error = %e, "Failed to queue message");
            }
        }
    }

    /// Send to one connection. Returns false if it is gone.
    pub async fn send_to(&self, id: &Uuid, message: &ServerMessage) -> bool {
        let Some(json) = Self::encode(message) else {
            return false;
        };
        let connections = self.connections.read().await;
        match connections.get(id) {
            Some(conn) => conn.tx.send(json).is_ok(),
            None => false,
        }
    }

    pub fn connection_count(&self) -> u64 {
        self.connection_count.load(Ordering::Relaxed)
    }

    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .read()
            .await
            .values()
            .map(|c| ConnectionInfo {
                id: c.id,
                state: c.state,
                connected_at: c.connected_at,
            })
            .collect()
    }
}

impl Default for GatewayHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_every_connection() {
        let hub = GatewayHub::new();
        let (_a, mut rx_a) = hub.register().await;
        let (_b, mut rx_b) = hub.register().await;

        hub.broadcast(&ServerMessage::error("boom")).await;

        for rx in [&mut rx_a, &mut rx_b] {
            let text = rx.recv().await.unwrap();
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(value["type"], "error");
            assert_eq!(value["message"], "boom");
        }
    }

    #[tokio::test]
    async fn test_send_to_and_unregister() {
        let hub = GatewayHub::new();
        let (a, mut rx_a) = hub.register().await;
        let (b, mut rx_b) = hub.register().await;
        assert_eq!(hub.connection_count(), 2);

        assert!(hub.send_to(&a, &ServerMessage::error("only a")).await);
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.try_recv().is_err());

        hub.unregister(&b).await;
        hub.unregister(&b).await;
        assert_eq!(hub.connection_count(), 1);
        assert!(!hub.send_to(&b, &ServerMessage::error("gone")).await);
    }

    #[tokio::test]
    async fn test_state_tracking() {
        let hub = GatewayHub::new();
        let (id, _rx) = hub.register().await;
        assert_eq!(hub.connections().await[0].state, ConnectionState::Connecting);

        hub.set_state(&id, ConnectionState::Connected).await;
        assert_eq!(hub.connections().await[0].state, ConnectionState::Connected);
    }
}
