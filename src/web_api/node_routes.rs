//! Node API Routes
//!
//! ## Endpoints
//! - POST /api/register - first contact, returns node_id + identity
//! - POST /api/node_online - node back under a previously assigned node_id
//! - POST /api/node_offline - orderly shutdown notice
//! - POST /api/heartbeat - liveness signal with optional readiness hint
//! - POST /api/capture_complete - acknowledgement of a scheduled capture

use axum::{extract::State, response::IntoResponse, routing::post, Json, Router};
use serde_json::json;

use crate::clock;
use crate::error::{Error, Result};
use crate::models::{
    CaptureCompleteRequest, HeartbeatRequest, HeartbeatResponse, NodeOfflineRequest,
    NodeOnlineRequest, RegisterRequest, RegisterResponse,
};
use crate::node_registry::{HeartbeatEffect, NodeAddress};
use crate::state::AppState;

/// Create node routes
pub fn node_routes() -> Router<AppState> {
    Router::new()
        .route("/api/register", post(register_node))
        .route("/api/node_online", post(node_online))
        .route("/api/node_offline", post(node_offline))
        .route("/api/heartbeat", post(heartbeat))
        .route("/api/capture_complete", post(capture_complete))
}

fn address(local_ip: &str, port: u16) -> Result<NodeAddress> {
    if local_ip.trim().is_empty() {
        return Err(Error::Validation("local_ip is required".to_string()));
    }
    if port == 0 {
        return Err(Error::Validation("node_port must be positive".to_string()));
    }
    Ok(NodeAddress::new(local_ip.trim(), port))
}

/// POST /api/register
async fn register_node(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse> {
    let address = address(&req.local_ip, req.node_port)?;
    let registration = state
        .registry
        .register(req.identity, address, req.capabilities.unwrap_or_default())
        .await;

    Ok(Json(RegisterResponse {
        success: true,
        node_id: registration.node_id,
        identity: registration.identity,
        reconnected: registration.reconnected,
    }))
}

/// POST /api/node_online
async fn node_online(
    State(state): State<AppState>,
    Json(req): Json<NodeOnlineRequest>,
) -> Result<impl IntoResponse> {
    let address = address(&req.local_ip, req.node_port)?;
    let registration = state
        .registry
        .restore(
            req.node_id,
            req.identity,
            address,
            req.capabilities.unwrap_or_default(),
        )
        .await?;

    Ok(Json(RegisterResponse {
        success: true,
        node_id: registration.node_id,
        identity: registration.identity,
        reconnected: registration.reconnected,
    }))
}

/// POST /api/node_offline
async fn node_offline(
    State(state): State<AppState>,
    Json(req): Json<NodeOfflineRequest>,
) -> Result<impl IntoResponse> {
    let changed = state.registry.mark_offline(req.node_id).await?;
    Ok(Json(json!({ "success": true, "changed": changed })))
}

/// POST /api/heartbeat
///
/// Unknown ids get 404 so the node falls back to registering again.
async fn heartbeat(
    State(state): State<AppState>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<impl IntoResponse> {
    let effect = state.registry.heartbeat(req.node_id, req.is_ready).await?;
    if effect == HeartbeatEffect::Recovered {
        tracing::info!(node_id = req.node_id, "Node recovered via heartbeat");
    }

    Ok(Json(HeartbeatResponse {
        success: true,
        timestamp: clock::to_epoch_seconds(state.clock.now()),
    }))
}

/// POST /api/capture_complete
async fn capture_complete(
    State(state): State<AppState>,
    Json(req): Json<CaptureCompleteRequest>,
) -> Result<impl IntoResponse> {
    let outcome = state
        .scheduler
        .acknowledge(&req.session_id, req.node_id, req.success, req.error)
        .await?;
    Ok(Json(json!({ "success": true, "outcome": outcome })))
}
