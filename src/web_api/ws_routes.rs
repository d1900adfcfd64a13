//! Operator WebSocket Channel

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};

use super::routes::schedule_capture;
use crate::capture_scheduler::CaptureResult;
use crate::gateway::{ClientRequest, ConnectionState, ServerMessage};
use crate::state::AppState;

/// WebSocket upgrade handler
pub(super) async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Answer one operator request
pub async fn dispatch(state: &AppState, request: ClientRequest) -> ServerMessage {
    match request {
        ClientRequest::GetCameras => {
            let (nodes, counts) = state.registry.snapshot_with_counts().await;
            ServerMessage::camera_list(nodes, counts)
        }
        ClientRequest::SwitchCamera { node_id } => {
            let success = state.registry.switch_view(node_id).await;
            ServerMessage::CameraSwitched {
                success,
                current_node: success.then_some(node_id),
            }
        }
        ClientRequest::CheckReady => {
            let report = state.readiness.poll(state.config.readiness_deadline).await;
            ServerMessage::ReadyStatus {
                ready_status: report.ready_map(),
            }
        }
        ClientRequest::TriggerCapture { delay_seconds } => {
            let result = match schedule_capture(state, delay_seconds).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!(error_code = e.code(), error = %e, "Capture request refused");
                    CaptureResult::failed(e.code())
                }
            };
            ServerMessage::CaptureScheduled { result }
        }
    }
}

/// Handle WebSocket connection
async fn handle_websocket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Registered before the snapshot so no later push is missed
    let (conn_id, mut rx) = state.hub.register().await;

    let (nodes, counts) = state.registry.snapshot_with_counts().await;
    state
        .hub
        .send_to(&conn_id, &ServerMessage::camera_list(nodes, counts))
        .await;
    state.hub.set_state(&conn_id, ConnectionState::Connected).await;

    tracing::info!(connection_id = %conn_id, "Operator client connected");

    // Forward hub messages (pushes and replies) to the socket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    let recv_state = state.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Text(text)) => {
                    let reply = match serde_json::from_str::<ClientRequest>(&text) {
                        Ok(request) => {
                            tracing::debug!(connection_id = %conn_id, request = request.kind(), "Operator request");
                            dispatch(&recv_state, request).await
                        }
                        Err(e) => {
                            tracing::warn!(connection_id = %conn_id, error = %e, "Undecodable operator request");
                            ServerMessage::error(format!("invalid request: {}", e))
                        }
                    };
                    if !recv_state.hub.send_to(&conn_id, &reply).await {
                        break;
                    }
                }
                Ok(Message::Close(_)) => {
                    tracing::info!(connection_id = %conn_id, "Operator client closed connection");
                    break;
                }
                Err(e) => {
                    tracing::warn!(connection_id = %conn_id, error = %e, "WebSocket error");
                    break;
                }
                _ => {}
            }
        }
        conn_id
    });

    // Wait for either task to complete
    let conn_id = tokio::select! {
        _ = send_task => conn_id,
        result = recv_task => result.unwrap_or(conn_id),
    };

    state.hub.set_state(&conn_id, ConnectionState::Closed).await;
    state.hub.unregister(&conn_id).await;
}
