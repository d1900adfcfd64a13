//! camsync-master Library
//!
//! Coordinator for a fleet of camera nodes that fire at one shared instant
//!
//! ## Architecture
//!
//! 1. NodeRegistry - Authoritative node table (single writer)
//! 2. HeartbeatMonitor - Liveness loss detection
//! 3. ReadinessCoordinator - Scatter/gather readiness vote under a deadline
//! 4. CaptureScheduler - Absolute-time capture sessions
//! 5. SessionLog - Bounded record of finalized sessions
//! 6. Gateway - Operator channel protocol, hub and reconnecting client
//! 7. NodeClient - Coordinator to node transport
//! 8. Clock - Wall clock with SNTP offset
//! 9. Discovery - UDP coordinator discovery
//! 10. WebAPI - HTTP/WebSocket endpoints
//!
//! ## Design Principles
//!
//! - All node mutation goes through NodeRegistry; everyone else reads snapshots
//! - Deadline misses exclude a node from one round, never fail the round
//! - Capture accuracy depends on clock sync, not on network latency

pub mod capture_scheduler;
pub mod clock;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod heartbeat_monitor;
pub mod models;
pub mod node_client;
pub mod node_registry;
pub mod readiness;
pub mod session_log;
pub mod state;
pub mod web_api;

pub use error::{Error, Result};
pub use state::{AppConfig, AppState};
