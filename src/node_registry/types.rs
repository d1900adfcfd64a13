//! NodeRegistry types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Node connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Heartbeats arriving, eligible for readiness polls
    Online,
    /// Silent past the heartbeat timeout, or announced shutdown
    Offline,
    /// Armed for an in-flight capture session
    Capturing,
    /// Node reported a capture failure
    Error,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
            NodeStatus::Capturing => "capturing",
            NodeStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the node's own HTTP service listens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    #[serde(rename = "ip_address")]
    pub host: String,
    #[serde(rename = "node_port")]
    pub port: u16,
}

impl NodeAddress {
    /// Default node service port
    pub const DEFAULT_PORT: u16 = 8084;

    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Base URL of the node's HTTP service
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Capabilities a node reports at registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCapabilities {
    #[serde(default = "enabled")]
    pub camera: bool,
    #[serde(default = "enabled")]
    pub preview: bool,
    #[serde(default = "enabled")]
    pub capture: bool,
}

fn enabled() -> bool {
    true
}

impl Default for NodeCapabilities {
    fn default() -> Self {
        Self {
            camera: true,
            preview: true,
            capture: true,
        }
    }
}

/// A registered camera node
///
/// `is_ready` is only ever true while `status` is `Online`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: u32,
    /// Identity token presented on reconnect; not exposed to operator clients
    #[serde(skip)]
    pub identity: String,
    #[serde(flatten)]
    pub address: NodeAddress,
    pub status: NodeStatus,
    pub is_ready: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub capabilities: NodeCapabilities,
}

impl Node {
    pub fn is_online(&self) -> bool {
        self.status == NodeStatus::Online
    }
}

/// Mutation accepted by `NodeRegistry::update`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeUpdate {
    Status(NodeStatus),
    Ready(bool),
}

/// Result of a registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub node_id: u32,
    pub identity: String,
    /// True when the identity was already known
    pub reconnected: bool,
}

/// Effect of a heartbeat on the node it came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEffect {
    /// Node was already online; liveness timestamp refreshed
    Refreshed,
    /// Node came back from offline/error
    Recovered,
}

/// Aggregate counts derived from one snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCounts {
    pub total: usize,
    pub online: usize,
    pub ready: usize,
}

impl RegistryCounts {
    pub fn from_nodes(nodes: &[Node]) -> Self {
        Self {
            total: nodes.len(),
            online: nodes.iter().filter(|n| n.is_online()).count(),
            ready: nodes.iter().filter(|n| n.is_ready).count(),
        }
    }
}

/// Change notification emitted after every registry mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryChange {
    Registered { node_id: u32, reconnected: bool },
    StatusChanged {
        node_id: u32,
        from: NodeStatus,
        to: NodeStatus,
    },
    ReadinessChanged { node_id: u32, is_ready: bool },
    ReadinessRefreshed,
    ViewSwitched { node_id: Option<u32> },
}
