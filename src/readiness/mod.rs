//! ReadinessCoordinator - Scatter/Gather Readiness Vote
//!
//! ## Responsibilities
//!
//! - Query every online node "can you capture now" in parallel
//! - Enforce one shared deadline for the whole round
//! - Refresh `is_ready` in the registry from the round's result
//! - Keep the latest report so the scheduler can reuse a fresh one
//!
//! A node that misses the deadline is reported not ready for this round
//! only. Liveness stays the HeartbeatMonitor's business.

use crate::node_client::NodeClient;
use crate::node_registry::{Node, NodeRegistry, NodeStatus};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{timeout_at, Instant};

/// Per-node result of one readiness round
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum ReadinessOutcome {
    Ready,
    NotReady,
    /// No reply before the round deadline
    Timeout,
    /// Transport error talking to the node
    Failed(String),
    /// Not queried because the node is not online
    Skipped(NodeStatus),
}

impl ReadinessOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, ReadinessOutcome::Ready)
    }
}

/// Aggregated result of one readiness round
#[derive(Debug, Clone)]
pub struct ReadinessReport {
    pub polled_at: DateTime<Utc>,
    taken_at: Instant,
    /// Registry generation the round was taken against
    generation: u64,
    pub outcomes: BTreeMap<u32, ReadinessOutcome>,
    /// Slowest successful reply this round
    pub round_trip: Option<Duration>,
}

impl ReadinessReport {
    /// node_id -> ready, for every node known at poll time
    pub fn ready_map(&self) -> BTreeMap<u32, bool> {
        self.outcomes
            .iter()
            .map(|(id, outcome)| (*id, outcome.is_ready()))
            .collect()
    }

    /// Ids that answered ready, ascending
    pub fn ready_nodes(&self) -> Vec<u32> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_ready())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn age(&self) -> Duration {
        self.taken_at.elapsed()
    }

    pub fn is_fresh(&self, max_age: Duration) -> bool {
        self.age() <= max_age
    }
}

/// ReadinessCoordinator instance
pub struct ReadinessCoordinator {
    registry: Arc<NodeRegistry>,
    client: Arc<dyn NodeClient>,
    latest: RwLock<Option<ReadinessReport>>,
}

impl ReadinessCoordinator {
    pub fn new(registry: Arc<NodeRegistry>, client: Arc<dyn NodeClient>) -> Self {
        Self {
            registry,
            client,
            latest: RwLock::new(None),
        }
    }

    /// Run one readiness round under `deadline`
    pub async fn poll(&self, deadline: Duration) -> ReadinessReport {
        let (nodes, generation) = self.registry.snapshot_with_generation().await;
        let deadline_at = Instant::now() + deadline;
        let polled_at = Utc::now();

        let (online, others): (Vec<Node>, Vec<Node>) =
            nodes.into_iter().partition(|n| n.is_online());

        let queries = online.into_iter().map(|node| {
            let client = self.client.clone();
            async move {
                let started = Instant::now();
                let outcome = match timeout_at(deadline_at, client.query_ready(&node)).await {
                    Ok(Ok(true)) => ReadinessOutcome::Ready,
                    Ok(Ok(false)) => ReadinessOutcome::NotReady,
                    Ok(Err(e)) => {
                        tracing::warn!(node_id = node.node_id, error = %e, "Readiness query failed");
                        ReadinessOutcome::Failed(e.to_string())
                    }
                    Err(_) => {
                        tracing::warn!(node_id = node.node_id, "Readiness query timed out");
                        ReadinessOutcome::Timeout
                    }
                };
                let round_trip = match outcome {
                    ReadinessOutcome::Ready | ReadinessOutcome::NotReady => Some(started.elapsed()),
                    _ => None,
                };
                (node.node_id, outcome, round_trip)
            }
        });

        let results = join_all(queries).await;

        let mut outcomes: BTreeMap<u32, ReadinessOutcome> = others
            .into_iter()
            .map(|n| (n.node_id, ReadinessOutcome::Skipped(n.status)))
            .collect();
        let mut round_trip: Option<Duration> = None;
        for (node_id, outcome, rtt) in results {
            if let Some(rtt) = rtt {
                round_trip = Some(round_trip.map_or(rtt, |max| max.max(rtt)));
            }
            outcomes.insert(node_id, outcome);
        }

        let report = ReadinessReport {
            polled_at,
            taken_at: Instant::now(),
            generation,
            outcomes,
            round_trip,
        };

        self.registry.apply_readiness(&report.ready_map()).await;

        tracing::info!(
            polled = report.outcomes.len(),
            ready = report.ready_nodes().len(),
            round_trip_ms = report.round_trip.map(|d| d.as_millis() as u64),
            "Readiness round complete"
        );

        *self.latest.write().await = Some(report.clone());
        report
    }

    /// Latest report, if any round has run
    pub async fn latest(&self) -> Option<ReadinessReport> {
        self.latest.read().await.clone()
    }

    /// Latest report if younger than `max_age` and no node was admitted or
    /// changed status since, otherwise a new round
    pub async fn fresh_or_poll(&self, max_age: Duration, deadline: Duration) -> ReadinessReport {
        if let Some(report) = self.latest().await {
            if report.is_fresh(max_age) && report.generation == self.registry.generation().await {
                tracing::debug!(age_ms = report.age().as_millis() as u64, "Reusing readiness report");
                return report;
            }
        }
        self.poll(deadline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_client::fake::{Behavior, FakeNodeClient};
    use crate::node_registry::{NodeAddress, NodeCapabilities};

    async fn setup(count: u8) -> (Arc<NodeRegistry>, Arc<FakeNodeClient>, ReadinessCoordinator) {
        let registry = Arc::new(NodeRegistry::new());
        for i in 1..=count {
            registry
                .register(
                    Some(format!("node-{}", i)),
                    NodeAddress::new(format!("10.0.0.{}", i), NodeAddress::DEFAULT_PORT),
                    NodeCapabilities::default(),
                )
                .await;
        }
        let client = Arc::new(FakeNodeClient::new());
        let coordinator = ReadinessCoordinator::new(registry.clone(), client.clone());
        (registry, client, coordinator)
    }

    #[tokio::test]
    async fn test_poll_collects_all_replies() {
        let (registry, client, coordinator) = setup(3).await;
        client.set_ready(2, Behavior::NotReady);

        let report = coordinator.poll(Duration::from_secs(1)).await;
        let expected: BTreeMap<u32, bool> = [(1, true), (2, false), (3, true)].into();
        assert_eq!(report.ready_map(), expected);
        assert_eq!(report.ready_nodes(), vec![1, 3]);

        assert!(registry.get(1).await.unwrap().is_ready);
        assert!(!registry.get(2).await.unwrap().is_ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_node_excluded_not_offlined() {
        let (registry, client, coordinator) = setup(2).await;
        client.set_ready(2, Behavior::Slow(Duration::from_secs(5)));

        let report = coordinator.poll(Duration::from_millis(500)).await;
        assert_eq!(report.outcomes[&2], ReadinessOutcome::Timeout);
        assert_eq!(report.ready_nodes(), vec![1]);

        let node = registry.get(2).await.unwrap();
        assert_eq!(node.status, NodeStatus::Online);
        assert!(!node.is_ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queries_run_concurrently() {
        let (_registry, client, coordinator) = setup(3).await;
        for id in 1..=3 {
            client.set_ready(id, Behavior::Slow(Duration::from_millis(400)));
        }

        let started = Instant::now();
        let report = coordinator.poll(Duration::from_millis(500)).await;
        assert_eq!(report.ready_nodes(), vec![1, 2, 3]);
        // sequential polling would need 1200ms
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_offline_node_is_skipped() {
        let (registry, client, coordinator) = setup(2).await;
        registry.mark_offline(2).await.unwrap();
        client.set_ready(2, Behavior::Ready);

        let report = coordinator.poll(Duration::from_secs(1)).await;
        assert_eq!(
            report.outcomes[&2],
            ReadinessOutcome::Skipped(NodeStatus::Offline)
        );
        assert!(!report.ready_map()[&2]);
    }

    #[tokio::test]
    async fn test_unreachable_node_reported_failed() {
        let (_registry, client, coordinator) = setup(1).await;
        client.set_ready(1, Behavior::Unreachable);

        let report = coordinator.poll(Duration::from_secs(1)).await;
        assert!(matches!(report.outcomes[&1], ReadinessOutcome::Failed(_)));
        assert!(report.round_trip.is_none());
    }

    #[tokio::test]
    async fn test_fresh_report_is_reused() {
        let (_registry, client, coordinator) = setup(1).await;
        let first = coordinator.poll(Duration::from_secs(1)).await;

        client.set_ready(1, Behavior::NotReady);
        let reused = coordinator
            .fresh_or_poll(Duration::from_secs(60), Duration::from_secs(1))
            .await;
        assert_eq!(reused.polled_at, first.polled_at);
        assert_eq!(reused.ready_nodes(), vec![1]);

        let fresh = coordinator
            .fresh_or_poll(Duration::ZERO, Duration::from_secs(1))
            .await;
        assert!(fresh.ready_nodes().is_empty());
    }

    #[tokio::test]
    async fn test_status_change_invalidates_cached_report() {
        let (registry, client, coordinator) = setup(2).await;
        let first = coordinator.poll(Duration::from_secs(1)).await;
        assert_eq!(first.ready_nodes(), vec![1, 2]);

        // Node 2 drops and comes back, now not ready
        registry.mark_offline(2).await.unwrap();
        registry
            .register(
                Some("node-2".to_string()),
                NodeAddress::new("10.0.0.2", NodeAddress::DEFAULT_PORT),
                NodeCapabilities::default(),
            )
            .await;
        client.set_ready(2, Behavior::NotReady);

        let report = coordinator
            .fresh_or_poll(Duration::from_secs(60), Duration::from_secs(1))
            .await;
        assert_eq!(report.ready_nodes(), vec![1]);
    }
}
