//! WebAPI - HTTP and WebSocket Endpoints
//!
//! ## Responsibilities
//!
//! - Operator control channel (`/ws`) and its REST mirrors
//! - Node interface (register, heartbeat, acknowledgements)
//! - Per-node stream proxy with placeholder fallback
//! - Health output

mod node_routes;
mod routes;
mod ws_routes;

pub use node_routes::node_routes;
pub use routes::create_router;
pub use ws_routes::dispatch;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::clock::Clock;
use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    // Synchronized means a successful sync within two intervals
    let max_age = chrono::Duration::from_std(state.config.ntp_sync_interval * 2)
        .unwrap_or(chrono::Duration::MAX);
    let clock_synchronized = match &state.time_sync {
        Some(sync) => Some(sync.is_synchronized(max_age).await),
        None => None,
    };

    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_sec: state.started_at.elapsed().as_secs(),
        nodes: state.registry.counts().await,
        active_view: state.registry.active_view().await,
        operator_connections: state.hub.connection_count(),
        operators: state.hub.connections().await,
        sessions_in_flight: state.scheduler.in_flight().await.len(),
        sessions_recorded: state.session_log.total_appended().await,
        max_clock_skew_ms: state.clock.max_skew().num_milliseconds(),
        clock_synchronized,
        clock_offset_ms: state
            .time_sync
            .as_ref()
            .map(|sync| sync.offset().num_milliseconds()),
    };

    Json(response)
}
