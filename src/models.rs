//! Request/response bodies for the HTTP API

use crate::gateway::hub::ConnectionInfo;
use crate::node_registry::{Node, NodeCapabilities, RegistryCounts};
use serde::{Deserialize, Serialize};

/// API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_sec: u64,
    pub nodes: RegistryCounts,
    pub active_view: Option<u32>,
    pub operator_connections: u64,
    /// Currently attached operator clients
    pub operators: Vec<ConnectionInfo>,
    pub sessions_in_flight: usize,
    pub sessions_recorded: u64,
    /// Assumed worst-case skew between node clocks
    pub max_clock_skew_ms: i64,
    /// `None` when SNTP sync is disabled
    pub clock_synchronized: Option<bool>,
    pub clock_offset_ms: Option<i64>,
}

fn default_node_port() -> u16 {
    crate::node_registry::NodeAddress::DEFAULT_PORT
}

// ========================================
// Node -> coordinator
// ========================================

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub identity: Option<String>,
    pub local_ip: String,
    #[serde(default = "default_node_port")]
    pub node_port: u16,
    #[serde(default)]
    pub capabilities: Option<NodeCapabilities>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub success: bool,
    pub node_id: u32,
    pub identity: String,
    pub reconnected: bool,
}

/// Node announcing itself under an id it was given earlier
#[derive(Debug, Clone, Deserialize)]
pub struct NodeOnlineRequest {
    pub node_id: u32,
    #[serde(default)]
    pub identity: Option<String>,
    pub local_ip: String,
    #[serde(default = "default_node_port")]
    pub node_port: u16,
    #[serde(default)]
    pub capabilities: Option<NodeCapabilities>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeOfflineRequest {
    pub node_id: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: u32,
    #[serde(default)]
    pub is_ready: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub success: bool,
    /// Coordinator time, Unix seconds
    pub timestamp: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureCompleteRequest {
    pub node_id: u32,
    pub session_id: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

// ========================================
// Operator REST mirrors
// ========================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CamerasResponse {
    pub cameras: Vec<Node>,
    pub current_preview: Option<u32>,
    pub online_count: usize,
    pub ready_count: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaptureRequest {
    #[serde(default)]
    pub delay_seconds: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwitchCameraRequest {
    pub node_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchCameraResponse {
    pub success: bool,
    pub current_node: Option<u32>,
}
