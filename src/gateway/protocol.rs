//! Operator channel wire protocol
//!
//! JSON objects tagged by `type`. Requests and replies are correlated by
//! message kind, one reply per request.

use crate::capture_scheduler::{CaptureResult, Session};
use crate::node_registry::{Node, RegistryCounts};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Operator client -> coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    GetCameras,
    SwitchCamera {
        node_id: u32,
    },
    CheckReady,
    TriggerCapture {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay_seconds: Option<f64>,
    },
}

impl ClientRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientRequest::GetCameras => "get_cameras",
            ClientRequest::SwitchCamera { .. } => "switch_camera",
            ClientRequest::CheckReady => "check_ready",
            ClientRequest::TriggerCapture { .. } => "trigger_capture",
        }
    }
}

/// Coordinator -> operator client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to `get_cameras`, and the first push on every new connection
    CameraList {
        data: Vec<Node>,
        online_count: usize,
        ready_count: usize,
    },
    /// Pushed after any registry change
    CameraListUpdated {
        data: Vec<Node>,
        online_count: usize,
        ready_count: usize,
    },
    CameraSwitched {
        success: bool,
        current_node: Option<u32>,
    },
    ReadyStatus {
        #[serde(deserialize_with = "node_id_map")]
        ready_status: BTreeMap<u32, bool>,
    },
    CaptureScheduled {
        result: CaptureResult,
    },
    /// Pushed when a capture session is finalized
    SessionRecorded {
        session: Session,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn camera_list(data: Vec<Node>, counts: RegistryCounts) -> Self {
        ServerMessage::CameraList {
            data,
            online_count: counts.online,
            ready_count: counts.ready,
        }
    }

    pub fn camera_list_updated(data: Vec<Node>, counts: RegistryCounts) -> Self {
        ServerMessage::CameraListUpdated {
            data,
            online_count: counts.online,
            ready_count: counts.ready,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::CameraList { .. } => "camera_list",
            ServerMessage::CameraListUpdated { .. } => "camera_list_updated",
            ServerMessage::CameraSwitched { .. } => "camera_switched",
            ServerMessage::ReadyStatus { .. } => "ready_status",
            ServerMessage::CaptureScheduled { .. } => "capture_scheduled",
            ServerMessage::SessionRecorded { .. } => "session_recorded",
            ServerMessage::Error { .. } => "error",
        }
    }
}

/// Node-id keyed map; JSON object keys arrive as strings
fn node_id_map<'de, D>(deserializer: D) -> Result<BTreeMap<u32, bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, bool>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(key, ready)| {
            key.parse::<u32>()
                .map(|id| (id, ready))
                .map_err(serde::de::Error::custom)
        })
        .collect()
}
