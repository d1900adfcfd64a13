//! CaptureScheduler - Synchronized Capture Sessions
//!
//! ## Responsibilities
//!
//! - Turn "capture now" into an absolute future instant (`now + margin`)
//! - Deliver that instant to every ready node concurrently
//! - Drop nodes whose delivery misses `scheduled_epoch - safety_buffer`
//! - Aggregate node acknowledgements into the session outcome
//! - Record finalized sessions in the SessionLog and announce them
//!
//! ## Timing
//!
//! ```text
//!  schedule()         delivery deadline     scheduled_epoch      finalize
//!     |---- margin - safety_buffer ----|-- safety --|--- ack_timeout ---|
//! ```
//!
//! Nodes fire against their own synchronized clocks, so accuracy is bounded
//! by clock skew, not by network latency.

mod types;

pub use types::*;

use crate::clock::{self, Clock};
use crate::error::{Error, Result};
use crate::node_client::{CaptureCommand, NodeClient};
use crate::node_registry::{Node, NodeRegistry, NodeStatus, NodeUpdate};
use crate::readiness::ReadinessCoordinator;
use crate::session_log::SessionLog;
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::{timeout_at, Instant};

const RECORDED_CHANNEL_CAPACITY: usize = 64;

/// CaptureScheduler instance
pub struct CaptureScheduler {
    registry: Arc<NodeRegistry>,
    readiness: Arc<ReadinessCoordinator>,
    client: Arc<dyn NodeClient>,
    clock: Arc<dyn Clock>,
    log: Arc<SessionLog>,
    config: SchedulerConfig,
    in_flight: RwLock<HashMap<String, Session>>,
    sequence: AtomicU64,
    recorded: broadcast::Sender<Session>,
}

impl CaptureScheduler {
    pub fn new(
        registry: Arc<NodeRegistry>,
        readiness: Arc<ReadinessCoordinator>,
        client: Arc<dyn NodeClient>,
        clock: Arc<dyn Clock>,
        log: Arc<SessionLog>,
        config: SchedulerConfig,
    ) -> Self {
        let (recorded, _) = broadcast::channel(RECORDED_CHANNEL_CAPACITY);
        Self {
            registry,
            readiness,
            client,
            clock,
            log,
            config,
            in_flight: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            recorded,
        }
    }

    /// Subscribe to finalized sessions
    pub fn subscribe(&self) -> broadcast::Receiver<Session> {
        self.recorded.subscribe()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn validate_margin(&self, margin: Duration) -> Result<()> {
        if margin <= self.config.safety_buffer {
            return Err(Error::Validation(format!(
                "margin {}ms must exceed the {}ms safety buffer",
                margin.as_millis(),
                self.config.safety_buffer.as_millis()
            )));
        }
        if margin > self.config.max_margin {
            return Err(Error::Validation(format!(
                "margin {}ms exceeds the {}ms maximum",
                margin.as_millis(),
                self.config.max_margin.as_millis()
            )));
        }
        Ok(())
    }

    fn next_session_id(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        format!("capture_{}_{}", Utc::now().timestamp_millis(), seq)
    }

    /// Schedule a synchronized capture `margin` from now (configured default if `None`)
    ///
    /// Returns the session as scheduled; its outcome stays `Pending` until
    /// acknowledgements arrive or the ack timeout passes. A session where
    /// every delivery failed is recorded immediately.
    pub async fn schedule(self: &Arc<Self>, margin: Option<Duration>) -> Result<Session> {
        let margin = margin.unwrap_or(self.config.default_margin);
        self.validate_margin(margin)?;

        let report = self
            .readiness
            .fresh_or_poll(self.config.readiness_max_age, self.config.readiness_deadline)
            .await;

        let candidates = report.ready_nodes();
        if candidates.is_empty() {
            tracing::warn!(
                polled = report.outcomes.len(),
                "Capture refused: no ready nodes"
            );
            return Err(Error::NoReadyNodes);
        }

        let delivery_window = margin - self.config.safety_buffer;
        if self.config.rtt_guard {
            if let Some(rtt) = report.round_trip {
                if rtt >= delivery_window {
                    tracing::warn!(
                        margin_ms = margin.as_millis() as u64,
                        rtt_ms = rtt.as_millis() as u64,
                        "Capture refused: margin cannot absorb round trip"
                    );
                    return Err(Error::MarginTooSmall {
                        margin_ms: margin.as_millis() as i64,
                        rtt_ms: rtt.as_millis() as i64,
                    });
                }
            }
        }

        let margin_chrono =
            chrono::Duration::from_std(margin).map_err(|e| Error::Internal(e.to_string()))?;

        // Still ready and not armed by a concurrent session
        let targets = self.registry.claim_for_capture(&candidates).await;
        if targets.is_empty() {
            tracing::warn!(
                candidates = ?candidates,
                "Capture refused: ready nodes no longer available"
            );
            return Err(Error::NoReadyNodes);
        }

        let now = self.clock.now();
        let scheduled_epoch = now + margin_chrono;
        let session_id = self.next_session_id();
        let command = CaptureCommand {
            capture_time: clock::to_epoch_seconds(scheduled_epoch),
            session_id: session_id.clone(),
            delay_seconds: margin.as_secs_f64(),
        };

        tracing::info!(
            session_id = %session_id,
            ready_nodes = ?targets.iter().map(|n| n.node_id).collect::<Vec<_>>(),
            margin_ms = margin.as_millis() as u64,
            capture_time = command.capture_time,
            "Scheduling capture"
        );

        let deadline = Instant::now() + delivery_window;
        let deliveries = self.deliver(&targets, &command, deadline).await;

        let mut armed_nodes = Vec::new();
        let mut dropped_nodes = Vec::new();
        for (node_id, outcome) in &deliveries {
            match outcome {
                DeliveryOutcome::Armed => armed_nodes.push(*node_id),
                other => {
                    tracing::warn!(
                        session_id = %session_id,
                        node_id = node_id,
                        outcome = ?other,
                        "Node dropped from session"
                    );
                    dropped_nodes.push(*node_id);
                }
            }
        }

        for node_id in &dropped_nodes {
            self.release_node(*node_id, NodeStatus::Online).await;
        }

        let session = Session {
            session_id: session_id.clone(),
            scheduled_epoch,
            capture_time: command.capture_time,
            formatted_time: clock::format_time(scheduled_epoch),
            margin_ms: margin.as_millis() as i64,
            ready_nodes: targets.iter().map(|n| n.node_id).collect(),
            armed_nodes,
            dropped_nodes,
            confirmed_nodes: Vec::new(),
            failed_nodes: Vec::new(),
            outcome: SessionOutcome::Pending,
            created_at: now,
            finalized_at: None,
        };

        if session.armed_nodes.is_empty() {
            tracing::error!(session_id = %session_id, "Every capture delivery failed");
            return Ok(self.record(session).await);
        }

        self.in_flight
            .write()
            .await
            .insert(session_id.clone(), session.clone());

        let until_epoch = (scheduled_epoch - self.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let wait = until_epoch + self.config.ack_timeout;
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(session) = scheduler.finalize(&session_id).await {
                tracing::info!(
                    session_id = %session.session_id,
                    missing = ?session.outstanding(),
                    "Session finalized on ack timeout"
                );
            }
        });

        Ok(session)
    }

    async fn deliver(
        &self,
        targets: &[Node],
        command: &CaptureCommand,
        deadline: Instant,
    ) -> Vec<(u32, DeliveryOutcome)> {
        let sends = targets.iter().map(|node| {
            let client = self.client.clone();
            async move {
                let outcome = match timeout_at(deadline, client.send_capture(node, command)).await {
                    Ok(Ok(true)) => DeliveryOutcome::Armed,
                    Ok(Ok(false)) => DeliveryOutcome::Rejected,
                    Ok(Err(e)) => DeliveryOutcome::Failed(e.to_string()),
                    Err(_) => DeliveryOutcome::TimedOut,
                };
                (node.node_id, outcome)
            }
        });
        join_all(sends).await
    }

    /// Record a node's acknowledgement of a session
    ///
    /// Finalizes the session once every armed node has answered.
    pub async fn acknowledge(
        &self,
        session_id: &str,
        node_id: u32,
        success: bool,
        error: Option<String>,
    ) -> Result<SessionOutcome> {
        let complete = {
            let mut in_flight = self.in_flight.write().await;
            let session = in_flight.get_mut(session_id).ok_or_else(|| {
                Error::Validation(format!("session {} is not in flight", session_id))
            })?;

            if !session.armed_nodes.contains(&node_id) {
                return Err(Error::Validation(format!(
                    "node {} is not armed for session {}",
                    node_id, session_id
                )));
            }
            if session.confirmed_nodes.contains(&node_id) || session.failed_nodes.contains(&node_id)
            {
                tracing::debug!(session_id = %session_id, node_id = node_id, "Duplicate acknowledgement");
                return Ok(session.outcome.clone());
            }

            if success {
                session.confirmed_nodes.push(node_id);
            } else {
                tracing::warn!(
                    session_id = %session_id,
                    node_id = node_id,
                    error = ?error,
                    "Node reported capture failure"
                );
                session.failed_nodes.push(node_id);
            }
            session.all_acknowledged()
        };

        let to = if success {
            NodeStatus::Online
        } else {
            NodeStatus::Error
        };
        self.release_node(node_id, to).await;

        if complete {
            if let Some(session) = self.finalize(session_id).await {
                return Ok(session.outcome);
            }
        }
        Ok(SessionOutcome::Pending)
    }

    /// Return a node from `Capturing`; leaves it alone if it went offline meanwhile
    async fn release_node(&self, node_id: u32, to: NodeStatus) {
        let capturing = self
            .registry
            .get(node_id)
            .await
            .is_some_and(|n| n.status == NodeStatus::Capturing);
        if capturing {
            if let Err(e) = self.registry.update(node_id, NodeUpdate::Status(to)).await {
                tracing::warn!(node_id = node_id, error = %e, "Failed to release node");
            }
        }
    }

    /// Finalize an in-flight session. Returns `None` if it was already finalized.
    pub async fn finalize(&self, session_id: &str) -> Option<Session> {
        let session = self.in_flight.write().await.remove(session_id)?;
        for node_id in session.outstanding() {
            self.release_node(node_id, NodeStatus::Online).await;
        }
        Some(self.record(session).await)
    }

    async fn record(&self, mut session: Session) -> Session {
        session.outcome = session.evaluate();
        session.finalized_at = Some(Utc::now());

        tracing::info!(
            session_id = %session.session_id,
            outcome = ?session.outcome,
            confirmed = session.confirmed_nodes.len(),
            ready = session.ready_nodes.len(),
            "Capture session recorded"
        );

        self.log.append(session.clone()).await;
        let _ = self.recorded.send(session.clone());
        session
    }

    /// Sessions still waiting for acknowledgements
    pub async fn in_flight(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.in_flight.read().await.values().cloned().collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::node_client::fake::{Behavior, FakeNodeClient};
    use crate::node_registry::{NodeAddress, NodeCapabilities};
    use std::collections::HashSet;

    struct Harness {
        registry: Arc<NodeRegistry>,
        readiness: Arc<ReadinessCoordinator>,
        client: Arc<FakeNodeClient>,
        log: Arc<SessionLog>,
        scheduler: Arc<CaptureScheduler>,
    }

    async fn harness(nodes: u8, config: SchedulerConfig) -> Harness {
        let registry = Arc::new(NodeRegistry::new());
        for i in 1..=nodes {
            registry
                .register(
                    Some(format!("cs-{}", i)),
                    NodeAddress::new(format!("10.2.0.{}", i), NodeAddress::DEFAULT_PORT),
                    NodeCapabilities::default(),
                )
                .await;
        }
        let client = Arc::new(FakeNodeClient::new());
        let readiness = Arc::new(ReadinessCoordinator::new(registry.clone(), client.clone()));
        let log = Arc::new(SessionLog::default());
        let scheduler = Arc::new(CaptureScheduler::new(
            registry.clone(),
            readiness.clone(),
            client.clone(),
            Arc::new(SystemClock::default()),
            log.clone(),
            config,
        ));
        Harness {
            registry,
            readiness,
            client,
            log,
            scheduler,
        }
    }

    #[tokio::test]
    async fn test_no_nodes_is_refused_without_session() {
        let h = harness(0, SchedulerConfig::default()).await;
        let err = h.scheduler.schedule(None).await.unwrap_err();
        assert!(matches!(err, Error::NoReadyNodes));
        assert!(h.log.is_empty().await);
        assert!(h.scheduler.in_flight().await.is_empty());
    }

    #[tokio::test]
    async fn test_schedule_targets_ready_nodes_only() {
        let h = harness(3, SchedulerConfig::default()).await;
        h.client.set_ready(2, Behavior::NotReady);

        let before = Utc::now();
        let session = h.scheduler.schedule(None).await.unwrap();
        assert_eq!(session.ready_nodes, vec![1, 3]);
        assert_eq!(session.armed_nodes, vec![1, 3]);
        assert!(session.outcome.is_pending());

        let lead = session.scheduled_epoch - before;
        assert!(lead >= chrono::Duration::milliseconds(500));
        assert!(lead < chrono::Duration::milliseconds(1500));

        let delivered: Vec<u32> = h.client.delivered().iter().map(|(id, _)| *id).collect();
        assert_eq!(delivered.len(), 2);
        assert!(h
            .client
            .delivered()
            .iter()
            .all(|(_, cmd)| cmd.session_id == session.session_id && cmd.delay_seconds == 0.5));

        assert_eq!(
            h.registry.get(1).await.unwrap().status,
            NodeStatus::Capturing
        );
        assert_eq!(h.registry.get(2).await.unwrap().status, NodeStatus::Online);
    }

    #[tokio::test]
    async fn test_session_ids_are_unique() {
        let h = harness(1, SchedulerConfig::default()).await;
        let mut ids = HashSet::new();
        for _ in 0..5 {
            let session = h.scheduler.schedule(None).await.unwrap();
            h.scheduler
                .acknowledge(&session.session_id, 1, true, None)
                .await
                .unwrap();
            assert!(ids.insert(session.session_id));
        }
    }

    #[tokio::test]
    async fn test_margin_bounds_are_validated() {
        let h = harness(1, SchedulerConfig::default()).await;
        let too_small = h
            .scheduler
            .schedule(Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(too_small, Error::Validation(_)));

        let too_large = h
            .scheduler
            .schedule(Some(Duration::from_secs(31)))
            .await
            .unwrap_err();
        assert!(matches!(too_large, Error::Validation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rtt_guard_refuses_tight_margin() {
        let h = harness(1, SchedulerConfig::default()).await;
        h.client.set_ready(1, Behavior::Slow(Duration::from_millis(450)));

        let err = h
            .scheduler
            .schedule(Some(Duration::from_millis(500)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MarginTooSmall { .. }));
        assert!(h.client.delivered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_delivery_is_dropped() {
        let config = SchedulerConfig {
            rtt_guard: false,
            ..SchedulerConfig::default()
        };
        let h = harness(2, config).await;
        h.client.set_capture(2, Behavior::Slow(Duration::from_secs(2)));

        let session = h.scheduler.schedule(None).await.unwrap();
        assert_eq!(session.armed_nodes, vec![1]);
        assert_eq!(session.dropped_nodes, vec![2]);
        assert_eq!(h.registry.get(2).await.unwrap().status, NodeStatus::Online);
    }

    #[tokio::test]
    async fn test_all_deliveries_failed_recorded_immediately() {
        let h = harness(2, SchedulerConfig::default()).await;
        h.client.set_capture(1, Behavior::Unreachable);
        h.client.set_capture(2, Behavior::NotReady);

        let mut recorded = h.scheduler.subscribe();
        let session = h.scheduler.schedule(None).await.unwrap();
        assert_eq!(
            session.outcome,
            SessionOutcome::Failure {
                reason: "delivery_failed".to_string()
            }
        );
        assert_eq!(h.log.len().await, 1);
        assert_eq!(recorded.recv().await.unwrap().session_id, session.session_id);

        let result = CaptureResult::from(&session);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("delivery_failed"));
    }

    #[tokio::test]
    async fn test_all_acks_finalize_success() {
        let h = harness(2, SchedulerConfig::default()).await;
        let session = h.scheduler.schedule(None).await.unwrap();

        let first = h
            .scheduler
            .acknowledge(&session.session_id, 1, true, None)
            .await
            .unwrap();
        assert!(first.is_pending());
        assert_eq!(h.registry.get(1).await.unwrap().status, NodeStatus::Online);

        let done = h
            .scheduler
            .acknowledge(&session.session_id, 2, true, None)
            .await
            .unwrap();
        assert_eq!(done, SessionOutcome::Success);

        let logged = h.log.latest().await.unwrap();
        assert_eq!(logged.session_id, session.session_id);
        assert_eq!(logged.confirmed_nodes, vec![1, 2]);
        assert!(h.scheduler.in_flight().await.is_empty());

        // late ack after finalization
        assert!(h
            .scheduler
            .acknowledge(&session.session_id, 2, true, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_failed_ack_puts_node_in_error() {
        let h = harness(2, SchedulerConfig::default()).await;
        let session = h.scheduler.schedule(None).await.unwrap();

        h.scheduler
            .acknowledge(&session.session_id, 1, true, None)
            .await
            .unwrap();
        let outcome = h
            .scheduler
            .acknowledge(&session.session_id, 2, false, Some("sensor busy".into()))
            .await
            .unwrap();
        assert_eq!(outcome, SessionOutcome::Partial);
        assert_eq!(h.registry.get(2).await.unwrap().status, NodeStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_acks_finalize_after_timeout() {
        let h = harness(2, SchedulerConfig::default()).await;
        let mut recorded = h.scheduler.subscribe();
        let session = h.scheduler.schedule(None).await.unwrap();
        h.scheduler
            .acknowledge(&session.session_id, 1, true, None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;

        let finalized = recorded.recv().await.unwrap();
        assert_eq!(finalized.session_id, session.session_id);
        assert_eq!(finalized.outcome, SessionOutcome::Partial);
        assert_eq!(h.registry.get(2).await.unwrap().status, NodeStatus::Online);
        assert!(h.scheduler.finalize(&session.session_id).await.is_none());
    }

    #[tokio::test]
    async fn test_returning_node_must_reassert_readiness() {
        let h = harness(2, SchedulerConfig::default()).await;
        let report = h.readiness.poll(Duration::from_secs(1)).await;
        assert_eq!(report.ready_nodes(), vec![1, 2]);

        h.registry.mark_offline(2).await.unwrap();
        h.registry
            .register(
                Some("cs-2".to_string()),
                NodeAddress::new("10.2.0.2", NodeAddress::DEFAULT_PORT),
                NodeCapabilities::default(),
            )
            .await;
        h.client.set_ready(2, Behavior::NotReady);

        let session = h.scheduler.schedule(None).await.unwrap();
        assert_eq!(session.ready_nodes, vec![1]);
        assert_eq!(session.armed_nodes, vec![1]);
        let node = h.registry.get(2).await.unwrap();
        assert_eq!(node.status, NodeStatus::Online);
        assert!(!node.is_ready);
    }

    #[tokio::test]
    async fn test_capturing_node_is_not_reused_from_cached_report() {
        let h = harness(2, SchedulerConfig::default()).await;
        let first = h.scheduler.schedule(None).await.unwrap();
        h.scheduler
            .acknowledge(&first.session_id, 1, true, None)
            .await
            .unwrap();

        // Node 2 is still armed for the first session
        let second = h.scheduler.schedule(None).await.unwrap();
        assert_eq!(second.armed_nodes, vec![1]);
        assert_eq!(
            h.registry.get(2).await.unwrap().status,
            NodeStatus::Capturing
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_schedules_never_share_a_node() {
        let h = harness(1, SchedulerConfig::default()).await;
        h.client.set_capture(1, Behavior::Slow(Duration::from_millis(200)));

        let (a, b) = tokio::join!(h.scheduler.schedule(None), h.scheduler.schedule(None));
        let (armed, refused) = match (a, b) {
            (Ok(session), Err(e)) | (Err(e), Ok(session)) => (session, e),
            (a, b) => panic!("expected exactly one session, got {:?} and {:?}", a, b),
        };
        assert_eq!(armed.armed_nodes, vec![1]);
        assert!(matches!(refused, Error::NoReadyNodes));
        assert_eq!(h.client.delivered().len(), 1);
        assert_eq!(h.scheduler.in_flight().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_node_is_released_for_next_session() {
        let config = SchedulerConfig {
            rtt_guard: false,
            ..SchedulerConfig::default()
        };
        let h = harness(2, config).await;
        h.client.set_capture(2, Behavior::Unreachable);

        let first = h.scheduler.schedule(None).await.unwrap();
        assert_eq!(first.dropped_nodes, vec![2]);
        assert_eq!(h.registry.get(2).await.unwrap().status, NodeStatus::Online);

        h.client.set_capture(2, Behavior::Ready);
        let second = h.scheduler.schedule(None).await.unwrap();
        assert_eq!(second.armed_nodes, vec![2]);
    }
}
