//! Discovery - UDP Coordinator Discovery Responder
//!
//! Nodes broadcast `{"type":"discover_master"}` on the discovery port and
//! use the answer to find the coordinator's HTTP API.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Default discovery port
pub const DEFAULT_PORT: u16 = 8085;

const MAX_DATAGRAM: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryMessage {
    DiscoverMaster {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_ip: Option<String>,
    },
    MasterResponse {
        master_ip: String,
        master_port: u16,
    },
}

/// Answers discovery requests with the coordinator's address
pub struct DiscoveryResponder {
    socket: UdpSocket,
    master_ip: String,
    master_port: u16,
}

impl DiscoveryResponder {
    pub async fn bind(bind_addr: SocketAddr, master_ip: String, master_port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        tracing::info!(
            addr = %socket.local_addr()?,
            master_ip = %master_ip,
            master_port = master_port,
            "Discovery responder bound"
        );
        Ok(Self {
            socket,
            master_ip,
            master_port,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Reply for one datagram, if it is a discovery request
    pub fn respond_to(&self, datagram: &[u8]) -> Option<Vec<u8>> {
        match serde_json::from_slice::<DiscoveryMessage>(datagram) {
            Ok(DiscoveryMessage::DiscoverMaster { .. }) => serde_json::to_vec(
                &DiscoveryMessage::MasterResponse {
                    master_ip: self.master_ip.clone(),
                    master_port: self.master_port,
                },
            )
            .ok(),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring non-discovery datagram");
                None
            }
        }
    }

    /// Serve until the socket fails
    pub async fn run(self) -> Result<()> {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            if let Some(reply) = self.respond_to(&buf[..len]) {
                if let Err(e) = self.socket.send_to(&reply, from).await {
                    tracing::warn!(from = %from, error = %e, "Discovery reply failed");
                    continue;
                }
                tracing::info!(from = %from, "Answered discovery request");
            }
        }
    }
}

/// Address of the interface used for outbound traffic
///
/// Connecting a UDP socket sends nothing; it only selects a route.
pub fn detect_local_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}
