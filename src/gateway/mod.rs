//! GatewayProtocol - Operator Message Channel
//!
//! ## Responsibilities
//!
//! - Wire protocol for operator clients (`protocol`)
//! - Fan-out to connected operator clients (`hub`)
//! - Reconnecting client side of the channel (`client`)
//! - Forward registry changes and recorded sessions as pushes
//!
//! The gateway never owns node or session data. Every push is built from a
//! fresh registry snapshot at push time.

pub mod client;
pub mod connection;
pub mod hub;
pub mod protocol;

pub use client::{ClientEvent, ControlClient, ReconnectPolicy};
pub use connection::ConnectionState;
pub use hub::GatewayHub;
pub use protocol::{ClientRequest, ServerMessage};

use crate::capture_scheduler::CaptureScheduler;
use crate::node_registry::NodeRegistry;
use std::sync::Arc;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;

/// Push `camera_list_updated` after registry changes
///
/// Changes that pile up while a push is being built are folded into the
/// next one. A lagged receiver just pushes a fresh snapshot.
pub fn spawn_registry_pump(registry: Arc<NodeRegistry>, hub: Arc<GatewayHub>) -> JoinHandle<()> {
    let mut changes = registry.subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => {
                    tracing::trace!(change = ?change, "Registry change");
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped = skipped, "Registry pump lagged");
                }
                Err(RecvError::Closed) => break,
            }

            loop {
                match changes.try_recv() {
                    Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Closed) => return,
                }
            }

            let (nodes, counts) = registry.snapshot_with_counts().await;
            hub.broadcast(&ServerMessage::camera_list_updated(nodes, counts))
                .await;
        }
        tracing::info!("Registry pump stopped");
    })
}

/// Push `session_recorded` for every finalized session
pub fn spawn_session_pump(scheduler: Arc<CaptureScheduler>, hub: Arc<GatewayHub>) -> JoinHandle<()> {
    let mut recorded = scheduler.subscribe();
    tokio::spawn(async move {
        loop {
            match recorded.recv().await {
                Ok(session) => {
                    hub.broadcast(&ServerMessage::SessionRecorded { session })
                        .await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped = skipped, "Session pump lagged, pushes dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::info!("Session pump stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_registry::{NodeAddress, NodeCapabilities};
    use std::time::Duration;

    #[tokio::test]
    async fn test_registry_change_is_pushed_with_counts() {
        let registry = Arc::new(NodeRegistry::new());
        let hub = Arc::new(GatewayHub::new());
        let (_id, mut rx) = hub.register().await;
        let pump = spawn_registry_pump(registry.clone(), hub.clone());

        registry
            .register(
                Some("gw-1".to_string()),
                NodeAddress::new("10.3.0.1", NodeAddress::DEFAULT_PORT),
                NodeCapabilities::default(),
            )
            .await;

        let text = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let msg: ServerMessage = serde_json::from_str(&text).unwrap();
        match msg {
            ServerMessage::CameraListUpdated {
                data,
                online_count,
                ready_count,
            } => {
                assert_eq!(data.len(), 1);
                assert_eq!(online_count, 1);
                assert_eq!(ready_count, 0);
            }
            other => panic!("unexpected message {:?}", other),
        }
        pump.abort();
    }
}
