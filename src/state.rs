//! Application state
//!
//! Holds all shared components and configuration

use crate::capture_scheduler::{CaptureScheduler, SchedulerConfig};
use crate::clock::{Clock, SyncedClock};
use crate::error::{Error, Result};
use crate::gateway::GatewayHub;
use crate::heartbeat_monitor::HeartbeatMonitor;
use crate::node_client::NodeClient;
use crate::node_registry::NodeRegistry;
use crate::readiness::ReadinessCoordinator;
use crate::session_log::SessionLog;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// IP announced in discovery replies; detected when unset
    pub advertised_ip: Option<String>,
    pub heartbeat_timeout: Duration,
    pub heartbeat_check_interval: Duration,
    /// Shared deadline of one readiness round
    pub readiness_deadline: Duration,
    /// Reuse a readiness report younger than this when scheduling
    pub readiness_max_age: Duration,
    pub capture_margin: Duration,
    pub max_capture_margin: Duration,
    pub safety_buffer: Duration,
    pub ack_timeout: Duration,
    /// Assumed worst-case skew between node clocks; documentation only
    pub max_clock_skew: Duration,
    pub rtt_guard: bool,
    pub session_log_capacity: usize,
    /// 0 disables the discovery responder
    pub discovery_port: u16,
    /// Empty disables coordinator-side SNTP sync
    pub ntp_servers: Vec<String>,
    pub ntp_sync_interval: Duration,
    pub stream_probe_timeout: Duration,
    /// Operator panel assets
    pub static_dir: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_or("PORT", 8080),
            advertised_ip: std::env::var("ADVERTISED_IP").ok(),
            heartbeat_timeout: Duration::from_secs(env_or("HEARTBEAT_TIMEOUT_SECS", 30)),
            heartbeat_check_interval: Duration::from_secs(env_or(
                "HEARTBEAT_CHECK_INTERVAL_SECS",
                10,
            )),
            readiness_deadline: Duration::from_millis(env_or("READINESS_DEADLINE_MS", 2000)),
            readiness_max_age: Duration::from_millis(env_or("READINESS_MAX_AGE_MS", 2000)),
            capture_margin: Duration::from_millis(env_or("CAPTURE_MARGIN_MS", 500)),
            max_capture_margin: Duration::from_millis(env_or("MAX_CAPTURE_MARGIN_MS", 30_000)),
            safety_buffer: Duration::from_millis(env_or("SAFETY_BUFFER_MS", 100)),
            ack_timeout: Duration::from_secs(env_or("ACK_TIMEOUT_SECS", 10)),
            max_clock_skew: Duration::from_millis(env_or("MAX_CLOCK_SKEW_MS", 50)),
            rtt_guard: env_bool("RTT_GUARD", true),
            session_log_capacity: env_or("SESSION_LOG_CAPACITY", 10),
            discovery_port: env_or("DISCOVERY_PORT", crate::discovery::DEFAULT_PORT),
            ntp_servers: std::env::var("NTP_SERVERS")
                .map(|s| {
                    s.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_else(|_| {
                    vec![
                        "pool.ntp.org".to_string(),
                        "time.nist.gov".to_string(),
                        "time.google.com".to_string(),
                    ]
                }),
            ntp_sync_interval: Duration::from_secs(env_or("NTP_SYNC_INTERVAL_SECS", 300)),
            stream_probe_timeout: Duration::from_millis(env_or("STREAM_PROBE_TIMEOUT_MS", 3000)),
            static_dir: std::env::var("STATIC_DIR").ok(),
        }
    }
}

impl AppConfig {
    /// Reject combinations the protocols cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_timeout.is_zero() || self.heartbeat_check_interval.is_zero() {
            return Err(Error::Config(
                "heartbeat timeout and check interval must be positive".to_string(),
            ));
        }
        if self.heartbeat_check_interval > self.heartbeat_timeout {
            return Err(Error::Config(format!(
                "heartbeat check interval {:?} exceeds timeout {:?}",
                self.heartbeat_check_interval, self.heartbeat_timeout
            )));
        }
        if self.readiness_deadline.is_zero() {
            return Err(Error::Config("readiness deadline must be positive".to_string()));
        }
        if self.capture_margin <= self.safety_buffer {
            return Err(Error::Config(format!(
                "capture margin {:?} must exceed safety buffer {:?}",
                self.capture_margin, self.safety_buffer
            )));
        }
        if self.capture_margin > self.max_capture_margin {
            return Err(Error::Config(format!(
                "capture margin {:?} exceeds maximum {:?}",
                self.capture_margin, self.max_capture_margin
            )));
        }
        if self.session_log_capacity == 0 {
            return Err(Error::Config("session log capacity must be positive".to_string()));
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            default_margin: self.capture_margin,
            max_margin: self.max_capture_margin,
            safety_buffer: self.safety_buffer,
            readiness_max_age: self.readiness_max_age,
            readiness_deadline: self.readiness_deadline,
            ack_timeout: self.ack_timeout,
            rtt_guard: self.rtt_guard,
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: AppConfig,
    /// NodeRegistry (single writer for node state)
    pub registry: Arc<NodeRegistry>,
    /// HeartbeatMonitor (liveness sweeps)
    pub heartbeat: Arc<HeartbeatMonitor>,
    /// ReadinessCoordinator (scatter/gather readiness)
    pub readiness: Arc<ReadinessCoordinator>,
    /// CaptureScheduler (synchronized sessions)
    pub scheduler: Arc<CaptureScheduler>,
    /// SessionLog (recent sessions)
    pub session_log: Arc<SessionLog>,
    /// GatewayHub (operator WebSocket fan-out)
    pub hub: Arc<GatewayHub>,
    /// Transport to camera nodes
    pub node_client: Arc<dyn NodeClient>,
    pub clock: Arc<dyn Clock>,
    /// Present when coordinator-side SNTP sync is enabled
    pub time_sync: Option<Arc<SyncedClock>>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire every component around one registry
    pub fn new(
        config: AppConfig,
        node_client: Arc<dyn NodeClient>,
        clock: Arc<dyn Clock>,
        time_sync: Option<Arc<SyncedClock>>,
    ) -> Self {
        let registry = Arc::new(NodeRegistry::new());
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            registry.clone(),
            config.heartbeat_timeout,
            config.heartbeat_check_interval,
        ));
        let readiness = Arc::new(ReadinessCoordinator::new(
            registry.clone(),
            node_client.clone(),
        ));
        let session_log = Arc::new(SessionLog::new(config.session_log_capacity));
        let scheduler = Arc::new(CaptureScheduler::new(
            registry.clone(),
            readiness.clone(),
            node_client.clone(),
            clock.clone(),
            session_log.clone(),
            config.scheduler_config(),
        ));

        Self {
            config,
            registry,
            heartbeat,
            readiness,
            scheduler,
            session_log,
            hub: Arc::new(GatewayHub::new()),
            node_client,
            clock,
            time_sync,
            started_at: Instant::now(),
        }
    }
}
