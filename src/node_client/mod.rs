//! NodeClient - Coordinator to Node Transport
//!
//! ## Responsibilities
//!
//! - Readiness query (`GET /ready`)
//! - Scheduled capture delivery (`POST /capture`)
//! - Live stream probe (`GET /stream`)
//!
//! The trait is the seam the readiness and scheduling protocols are tested
//! against; `HttpNodeClient` is the production implementation.

use crate::error::{Error, Result};
use crate::node_registry::Node;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(test)]
pub(crate) mod fake;

/// Scheduled capture command as a node receives it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureCommand {
    /// Absolute capture instant, Unix seconds
    pub capture_time: f64,
    pub session_id: String,
    /// Margin the coordinator used, informational for the node
    pub delay_seconds: f64,
}

/// Outcome of probing a node's live stream
#[derive(Debug)]
pub enum StreamProbe {
    /// Stream answered; body not yet consumed
    Live(reqwest::Response),
    /// Node refused or returned an error status
    Unavailable(String),
    /// No response before the probe deadline
    TimedOut,
}

impl StreamProbe {
    pub fn label(&self) -> &'static str {
        match self {
            StreamProbe::Live(_) => "live",
            StreamProbe::Unavailable(_) => "unavailable",
            StreamProbe::TimedOut => "timed_out",
        }
    }
}

/// Transport used to talk to camera nodes
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Ask a node whether it can capture immediately
    async fn query_ready(&self, node: &Node) -> Result<bool>;

    /// Deliver a scheduled capture; `Ok(true)` means the node armed its timer
    async fn send_capture(&self, node: &Node, command: &CaptureCommand) -> Result<bool>;

    /// Probe the node's continuous-image endpoint
    async fn probe_stream(&self, node: &Node, timeout: Duration) -> StreamProbe;
}

#[derive(Debug, Deserialize)]
struct ReadyResponse {
    #[serde(default)]
    ready: bool,
}

#[derive(Debug, Deserialize)]
struct CaptureResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP implementation of `NodeClient`
pub struct HttpNodeClient {
    client: reqwest::Client,
    /// No total timeout: proxied stream bodies are long-lived
    stream_client: reqwest::Client,
}

impl HttpNodeClient {
    /// Create a client; `request_timeout` caps any single node request.
    /// Protocol deadlines are applied by the callers on top of this.
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .build()?;
        let stream_client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            stream_client,
        })
    }
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn query_ready(&self, node: &Node) -> Result<bool> {
        let url = format!("{}/ready", node.address.base_url());
        let resp = self.client.get(&url).send().await?;

        if !resp.status().is_success() {
            return Err(Error::Network(format!(
                "node {} ready check returned {}",
                node.node_id,
                resp.status()
            )));
        }

        let body: ReadyResponse = resp.json().await?;
        Ok(body.ready)
    }

    async fn send_capture(&self, node: &Node, command: &CaptureCommand) -> Result<bool> {
        let url = format!("{}/capture", node.address.base_url());
        let resp = self.client.post(&url).json(command).send().await?;
        let status = resp.status();

        let body: CaptureResponse = resp.json().await.unwrap_or(CaptureResponse {
            success: false,
            error: Some(format!("HTTP {}", status)),
        });

        if !status.is_success() || !body.success {
            tracing::warn!(
                node_id = node.node_id,
                session_id = %command.session_id,
                status = %status,
                error = ?body.error,
                "Node rejected capture command"
            );
            return Ok(false);
        }

        Ok(true)
    }

    async fn probe_stream(&self, node: &Node, timeout: Duration) -> StreamProbe {
        let url = format!("{}/stream", node.address.base_url());
        // Headers only; the body may be an endless multipart stream
        match tokio::time::timeout(timeout, self.stream_client.get(&url).send()).await {
            Ok(Ok(resp)) if resp.status().is_success() => StreamProbe::Live(resp),
            Ok(Ok(resp)) => StreamProbe::Unavailable(format!("HTTP {}", resp.status())),
            Ok(Err(e)) if e.is_timeout() => StreamProbe::TimedOut,
            Ok(Err(e)) => StreamProbe::Unavailable(e.to_string()),
            Err(_) => StreamProbe::TimedOut,
        }
    }
}
