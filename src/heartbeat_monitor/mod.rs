//! HeartbeatMonitor - Node Liveness Supervision
//!
//! ## Responsibilities
//!
//! - Sweep the registry on its own timer
//! - Transition nodes silent for longer than the timeout to offline
//!
//! Heartbeats themselves arrive through the node API and land in
//! `NodeRegistry::heartbeat`; this monitor only detects their absence.
//! It never waits on readiness polls or capture scheduling.

use crate::node_registry::NodeRegistry;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};

/// HeartbeatMonitor instance
pub struct HeartbeatMonitor {
    registry: Arc<NodeRegistry>,
    timeout: Duration,
    check_interval: Duration,
    running: Arc<RwLock<bool>>,
}

impl HeartbeatMonitor {
    pub fn new(registry: Arc<NodeRegistry>, timeout: Duration, check_interval: Duration) -> Self {
        Self {
            registry,
            timeout,
            check_interval,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// One sweep at `now`. Returns the nodes that went offline on this sweep.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<u32> {
        Self::sweep_registry(&self.registry, self.timeout, now).await
    }

    async fn sweep_registry(
        registry: &NodeRegistry,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Vec<u32> {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        let expired = registry.expire_silent(now, timeout).await;
        for node_id in &expired {
            tracing::warn!(
                node_id = node_id,
                timeout_secs = timeout.num_seconds(),
                "Node heartbeat timed out"
            );
        }
        expired
    }

    /// Start the sweep loop
    pub async fn start(&self) {
        {
            let mut running = self.running.write().await;
            if *running {
                tracing::warn!("Heartbeat monitor already running");
                return;
            }
            *running = true;
        }

        tracing::info!(
            timeout_secs = self.timeout.as_secs(),
            check_interval_secs = self.check_interval.as_secs(),
            "Starting heartbeat monitor"
        );

        let registry = self.registry.clone();
        let timeout = self.timeout;
        let check_interval = self.check_interval;
        let running = self.running.clone();

        tokio::spawn(async move {
            let mut ticker = interval(check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                {
                    let is_running = running.read().await;
                    if !*is_running {
                        break;
                    }
                }

                Self::sweep_registry(&registry, timeout, Utc::now()).await;
            }

            tracing::info!("Heartbeat monitor stopped");
        });
    }

    /// Stop the sweep loop after its current tick
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        tracing::info!("Stopping heartbeat monitor");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}
