//! camsync-master - Synchronized Capture Coordinator
//!
//! Main entry point for the coordinator service.

use camsync_master::{
    clock::{Clock, SyncedClock, SystemClock},
    discovery::{self, DiscoveryResponder},
    gateway,
    node_client::{HttpNodeClient, NodeClient},
    state::{AppConfig, AppState},
    web_api,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camsync_master=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting camsync-master v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::default();
    config.validate()?;
    tracing::info!(
        host = %config.host,
        port = config.port,
        heartbeat_timeout_secs = config.heartbeat_timeout.as_secs(),
        capture_margin_ms = config.capture_margin.as_millis() as u64,
        safety_buffer_ms = config.safety_buffer.as_millis() as u64,
        max_clock_skew_ms = config.max_clock_skew.as_millis() as u64,
        rtt_guard = config.rtt_guard,
        "Configuration loaded"
    );

    let max_skew = chrono::Duration::from_std(config.max_clock_skew)?;

    // Clock: SNTP-corrected when servers are configured
    let (clock, time_sync): (Arc<dyn Clock>, Option<Arc<SyncedClock>>) =
        if config.ntp_servers.is_empty() {
            tracing::info!("SNTP sync disabled, trusting system clock");
            let system: Arc<dyn Clock> = Arc::new(SystemClock::new(max_skew));
            (system, None)
        } else {
            let synced = Arc::new(SyncedClock::new(config.ntp_servers.clone(), max_skew));
            synced.clone().start(config.ntp_sync_interval);
            tracing::info!(servers = ?config.ntp_servers, "SNTP sync started");
            let clock: Arc<dyn Clock> = synced.clone();
            (clock, Some(synced))
        };

    // Per-request cap; protocol deadlines are tighter and applied by callers
    let request_timeout = config.readiness_deadline.max(config.stream_probe_timeout);
    let node_client: Arc<dyn NodeClient> = Arc::new(HttpNodeClient::new(request_timeout)?);

    let state = AppState::new(config, node_client, clock, time_sync);
    tracing::info!("Components initialized");

    // Liveness supervision
    state.heartbeat.start().await;

    // Operator pushes
    gateway::spawn_registry_pump(state.registry.clone(), state.hub.clone());
    gateway::spawn_session_pump(state.scheduler.clone(), state.hub.clone());

    // Discovery responder
    if state.config.discovery_port != 0 {
        let master_ip = state
            .config
            .advertised_ip
            .clone()
            .or_else(discovery::detect_local_ip)
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let bind: SocketAddr = ([0, 0, 0, 0], state.config.discovery_port).into();
        match DiscoveryResponder::bind(bind, master_ip, state.config.port).await {
            Ok(responder) => {
                tokio::spawn(async move {
                    if let Err(e) = responder.run().await {
                        tracing::error!(error = %e, "Discovery responder stopped");
                    }
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to bind discovery responder, continuing without it");
            }
        }
    }

    // Create router, with the operator panel when configured
    let mut app = web_api::create_router(state.clone());
    if let Some(static_dir) = &state.config.static_dir {
        let serve_dir = ServeDir::new(static_dir)
            .not_found_service(ServeFile::new(format!("{}/index.html", static_dir)));
        app = app.fallback_service(serve_dir);
        tracing::info!(static_dir = %static_dir, "Static file serving enabled");
    }
    let app = app
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
