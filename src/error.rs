//! Error handling for the capture coordinator

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Operation targeted a node id that was never registered
    #[error("Unknown node: {0}")]
    UnknownNode(u32),

    /// Capture requested but no node reported ready
    #[error("No ready nodes")]
    NoReadyNodes,

    /// Requested margin cannot cover the measured round-trip
    #[error("Margin too small: margin {margin_ms}ms, round-trip estimate {rtt_ms}ms")]
    MarginTooSmall { margin_ms: i64, rtt_ms: i64 },

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Control channel closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Network error (node transport, discovery, time sync)
    #[error("Network error: {0}")]
    Network(String),

    /// Config error
    #[error("Config error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Machine-readable reason code, shared by HTTP responses and
    /// `capture_scheduled` results on the control channel
    pub fn code(&self) -> &'static str {
        match self {
            Error::UnknownNode(_) => "unknown_node",
            Error::NoReadyNodes => "no_ready_nodes",
            Error::MarginTooSmall { .. } => "margin_too_small",
            Error::Validation(_) => "validation_error",
            Error::ChannelClosed(_) => "channel_closed",
            Error::Network(_) => "network_error",
            Error::Config(_) => "config_error",
            Error::Serialization(_) => "serialization_error",
            Error::Http(_) => "http_error",
            Error::Io(_) => "io_error",
            Error::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::UnknownNode(_) => StatusCode::NOT_FOUND,
            Error::NoReadyNodes | Error::MarginTooSmall { .. } => StatusCode::CONFLICT,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::ChannelClosed(_) | Error::Network(_) | Error::Http(_) => {
                StatusCode::BAD_GATEWAY
            }
            Error::Config(_)
            | Error::Serialization(_)
            | Error::Io(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_code = self.code();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(
                status = %status,
                error_code = %error_code,
                message = %message,
                "Request error"
            );
        } else {
            tracing::warn!(
                status = %status,
                error_code = %error_code,
                message = %message,
                "Request rejected"
            );
        }

        let body = Json(json!({
            "error_code": error_code,
            "message": message
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_machine_readable() {
        assert_eq!(Error::NoReadyNodes.code(), "no_ready_nodes");
        assert_eq!(Error::UnknownNode(7).code(), "unknown_node");
        assert_eq!(
            Error::MarginTooSmall { margin_ms: 500, rtt_ms: 700 }.code(),
            "margin_too_small"
        );
    }

    #[test]
    fn test_unknown_node_maps_to_404() {
        let response = Error::UnknownNode(3).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
