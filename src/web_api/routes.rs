//! Operator API Routes
//!
//! REST mirrors of the control channel actions plus the per-node stream.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::time::Duration;

use super::node_routes::node_routes;
use super::ws_routes::websocket_handler;
use crate::capture_scheduler::CaptureResult;
use crate::error::{Error, Result};
use crate::models::{
    ApiResponse, CamerasResponse, CaptureRequest, SwitchCameraRequest, SwitchCameraResponse,
};
use crate::node_client::StreamProbe;
use crate::node_registry::NodeStatus;
use crate::state::AppState;

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/healthz", get(super::health_check))
        // Operator control channel
        .route("/ws", get(websocket_handler))
        // Operator REST mirrors
        .route("/api/cameras", get(list_cameras))
        .route("/api/capture", post(trigger_capture))
        .route("/api/switch_camera", post(switch_camera))
        .route("/api/ready", get(check_ready))
        .route("/api/sessions", get(list_sessions))
        // Live view
        .route("/stream/:node_id", get(stream_node))
        // Node interface
        .merge(node_routes())
        .with_state(state)
}

/// `delay_seconds` from a request, as a margin
pub(super) fn margin_from_seconds(delay_seconds: Option<f64>) -> Result<Option<Duration>> {
    delay_seconds
        .map(|secs| {
            Duration::try_from_secs_f64(secs)
                .map_err(|_| Error::Validation(format!("invalid delay_seconds: {}", secs)))
        })
        .transpose()
}

/// Shared by `POST /api/capture` and `trigger_capture`
pub(super) async fn schedule_capture(
    state: &AppState,
    delay_seconds: Option<f64>,
) -> Result<CaptureResult> {
    let margin = margin_from_seconds(delay_seconds)?;
    let session = state.scheduler.schedule(margin).await?;
    Ok(CaptureResult::from(&session))
}

// ========================================
// Cameras
// ========================================

async fn list_cameras(State(state): State<AppState>) -> impl IntoResponse {
    let (cameras, counts) = state.registry.snapshot_with_counts().await;
    Json(CamerasResponse {
        cameras,
        current_preview: state.registry.active_view().await,
        online_count: counts.online,
        ready_count: counts.ready,
    })
}

async fn switch_camera(
    State(state): State<AppState>,
    Json(req): Json<SwitchCameraRequest>,
) -> impl IntoResponse {
    let success = state.registry.switch_view(req.node_id).await;
    Json(SwitchCameraResponse {
        success,
        current_node: success.then_some(req.node_id),
    })
}

// ========================================
// Readiness / capture
// ========================================

async fn check_ready(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.readiness.poll(state.config.readiness_deadline).await;
    Json(serde_json::json!({
        "ready_status": report.ready_map(),
        "outcomes": report.outcomes,
        "round_trip_ms": report.round_trip.map(|d| d.as_millis() as u64),
    }))
}

async fn trigger_capture(
    State(state): State<AppState>,
    body: Option<Json<CaptureRequest>>,
) -> impl IntoResponse {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    match schedule_capture(&state, req.delay_seconds).await {
        Ok(result) => (StatusCode::OK, Json(result)),
        Err(e) => {
            tracing::warn!(error_code = e.code(), error = %e, "Capture request refused");
            (e.status(), Json(CaptureResult::failed(e.code())))
        }
    }
}

async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let recorded = state.session_log.list().await;
    let in_flight = state.scheduler.in_flight().await;
    Json(ApiResponse::success(serde_json::json!({
        "sessions": recorded,
        "in_flight": in_flight,
    })))
}

// ========================================
// Stream
// ========================================

fn placeholder(node_id: u32, probe: &str, detail: &str) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (header::CACHE_CONTROL, "no-store".to_string()),
            (
                header::HeaderName::from_static("x-stream-state"),
                probe.to_string(),
            ),
        ],
        format!("Camera {} stream unavailable ({})", node_id, detail),
    )
        .into_response()
}

/// GET /stream/:node_id
///
/// Proxies the node's continuous-image stream. Any non-live outcome answers
/// with a placeholder; operator control connections are unaffected.
async fn stream_node(
    State(state): State<AppState>,
    Path(node_id): Path<u32>,
) -> Result<Response> {
    let node = state
        .registry
        .get(node_id)
        .await
        .ok_or(Error::UnknownNode(node_id))?;

    if node.status == NodeStatus::Offline {
        return Ok(placeholder(node_id, "unavailable", "node offline"));
    }

    let probe = state
        .node_client
        .probe_stream(&node, state.config.stream_probe_timeout)
        .await;
    tracing::debug!(node_id = node_id, probe = probe.label(), "Stream probe");

    match probe {
        StreamProbe::Live(resp) => {
            let content_type = resp
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/octet-stream")
                .to_string();
            Ok((
                [
                    (header::CONTENT_TYPE, content_type),
                    (header::CACHE_CONTROL, "no-store".to_string()),
                ],
                Body::from_stream(resp.bytes_stream()),
            )
                .into_response())
        }
        StreamProbe::Unavailable(reason) => {
            tracing::warn!(node_id = node_id, reason = %reason, "Stream unavailable");
            Ok(placeholder(node_id, "unavailable", &reason))
        }
        StreamProbe::TimedOut => {
            tracing::warn!(node_id = node_id, "Stream probe timed out");
            Ok(placeholder(node_id, "timed_out", "timed out"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_margin_from_seconds() {
        assert_eq!(margin_from_seconds(None).unwrap(), None);
        assert_eq!(
            margin_from_seconds(Some(0.5)).unwrap(),
            Some(Duration::from_millis(500))
        );
        assert!(margin_from_seconds(Some(-1.0)).is_err());
        assert!(margin_from_seconds(Some(f64::NAN)).is_err());
    }
}
