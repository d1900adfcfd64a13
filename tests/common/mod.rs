//! Shared harness for the HTTP/WebSocket integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use camsync_master::clock::{Clock, SystemClock};
use camsync_master::error::Result;
use camsync_master::gateway;
use camsync_master::node_client::{CaptureCommand, NodeClient, StreamProbe};
use camsync_master::node_registry::Node;
use camsync_master::web_api;
use camsync_master::{AppConfig, AppState};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

/// In-process stand-in for the camera nodes
///
/// Every node answers ready and arms its timer unless listed otherwise.
#[derive(Default)]
pub struct StubNodes {
    not_ready: Mutex<HashSet<u32>>,
    captures: Mutex<Vec<(u32, CaptureCommand)>>,
}

impl StubNodes {
    pub fn set_not_ready(&self, node_id: u32) {
        self.not_ready.lock().unwrap().insert(node_id);
    }

    pub fn captures(&self) -> Vec<(u32, CaptureCommand)> {
        self.captures.lock().unwrap().clone()
    }
}

#[async_trait]
impl NodeClient for StubNodes {
    async fn query_ready(&self, node: &Node) -> Result<bool> {
        Ok(!self.not_ready.lock().unwrap().contains(&node.node_id))
    }

    async fn send_capture(&self, node: &Node, command: &CaptureCommand) -> Result<bool> {
        self.captures
            .lock()
            .unwrap()
            .push((node.node_id, command.clone()));
        Ok(true)
    }

    async fn probe_stream(&self, _node: &Node, _timeout: Duration) -> StreamProbe {
        StreamProbe::Unavailable("connection refused".to_string())
    }
}

/// Config for a coordinator that touches nothing outside the test process
pub fn test_config() -> AppConfig {
    AppConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        advertised_ip: None,
        heartbeat_timeout: Duration::from_secs(30),
        heartbeat_check_interval: Duration::from_secs(10),
        readiness_deadline: Duration::from_millis(500),
        readiness_max_age: Duration::from_millis(500),
        capture_margin: Duration::from_millis(500),
        max_capture_margin: Duration::from_secs(30),
        safety_buffer: Duration::from_millis(100),
        ack_timeout: Duration::from_secs(10),
        max_clock_skew: Duration::from_millis(50),
        rtt_guard: true,
        session_log_capacity: 10,
        discovery_port: 0,
        ntp_servers: Vec::new(),
        ntp_sync_interval: Duration::from_secs(300),
        stream_probe_timeout: Duration::from_millis(200),
        static_dir: None,
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub nodes: Arc<StubNodes>,
    pub http: reqwest::Client,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Register a node over the node API and return its id
    pub async fn register_node(&self, identity: &str, port: u16) -> u32 {
        let resp: serde_json::Value = self
            .http
            .post(self.url("/api/register"))
            .json(&serde_json::json!({
                "identity": identity,
                "local_ip": "127.0.0.1",
                "node_port": port,
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resp["success"], true);
        resp["node_id"].as_u64().unwrap() as u32
    }

    pub async fn heartbeat(&self, node_id: u32) -> reqwest::StatusCode {
        self.http
            .post(self.url("/api/heartbeat"))
            .json(&serde_json::json!({ "node_id": node_id }))
            .send()
            .await
            .unwrap()
            .status()
    }
}

/// Serve the full router on `listener`
pub fn serve_on(listener: TcpListener, state: AppState) {
    gateway::spawn_registry_pump(state.registry.clone(), state.hub.clone());
    gateway::spawn_session_pump(state.scheduler.clone(), state.hub.clone());
    let app = web_api::create_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
}

pub async fn spawn_server(config: AppConfig) -> TestServer {
    let nodes = Arc::new(StubNodes::default());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::default());
    let state = AppState::new(config, nodes.clone(), clock, None);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    serve_on(listener, state.clone());

    TestServer {
        addr,
        state,
        nodes,
        http: reqwest::Client::new(),
    }
}
