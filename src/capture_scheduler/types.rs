//! CaptureScheduler types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Final (or pending) result of a capture session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionOutcome {
    /// Acknowledgements still outstanding
    Pending,
    /// Every ready node confirmed
    Success,
    /// Some, not all, ready nodes confirmed
    Partial,
    Failure { reason: String },
}

impl SessionOutcome {
    pub const DELIVERY_FAILED: &'static str = "delivery_failed";
    pub const NO_CONFIRMATIONS: &'static str = "no_confirmations";

    pub fn is_pending(&self) -> bool {
        matches!(self, SessionOutcome::Pending)
    }
}

/// Result of delivering the capture command to one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Node accepted and armed its timer
    Armed,
    /// Node answered but refused
    Rejected,
    /// No answer before `scheduled_epoch - safety_buffer`
    TimedOut,
    Failed(String),
}

/// One synchronized capture attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub scheduled_epoch: DateTime<Utc>,
    /// `scheduled_epoch` as Unix seconds, as sent to nodes
    pub capture_time: f64,
    pub formatted_time: String,
    pub margin_ms: i64,
    /// Frozen at schedule time from the readiness report
    pub ready_nodes: Vec<u32>,
    pub armed_nodes: Vec<u32>,
    pub dropped_nodes: Vec<u32>,
    pub confirmed_nodes: Vec<u32>,
    /// Nodes that acknowledged with a failure
    pub failed_nodes: Vec<u32>,
    pub outcome: SessionOutcome,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Armed nodes that have not acknowledged yet
    pub fn outstanding(&self) -> Vec<u32> {
        self.armed_nodes
            .iter()
            .filter(|id| !self.confirmed_nodes.contains(id) && !self.failed_nodes.contains(id))
            .copied()
            .collect()
    }

    pub fn all_acknowledged(&self) -> bool {
        self.outstanding().is_empty()
    }

    /// Outcome from the acknowledgements collected so far
    pub fn evaluate(&self) -> SessionOutcome {
        if self.armed_nodes.is_empty() {
            return SessionOutcome::Failure {
                reason: SessionOutcome::DELIVERY_FAILED.to_string(),
            };
        }
        let confirmed = self.confirmed_nodes.len();
        if confirmed == 0 {
            SessionOutcome::Failure {
                reason: SessionOutcome::NO_CONFIRMATIONS.to_string(),
            }
        } else if confirmed == self.ready_nodes.len() {
            SessionOutcome::Success
        } else {
            SessionOutcome::Partial
        }
    }
}

/// Reply to an operator `trigger_capture`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureResult {
    pub success: bool,
    pub ready_nodes: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_time_formatted: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CaptureResult {
    pub fn failed(error_code: impl Into<String>) -> Self {
        Self {
            success: false,
            ready_nodes: Vec::new(),
            session_id: None,
            capture_time: None,
            capture_time_formatted: None,
            error: Some(error_code.into()),
        }
    }
}

impl From<&Session> for CaptureResult {
    fn from(session: &Session) -> Self {
        let delivered = !session.armed_nodes.is_empty();
        Self {
            success: delivered,
            ready_nodes: session.ready_nodes.clone(),
            session_id: Some(session.session_id.clone()),
            capture_time: Some(session.capture_time),
            capture_time_formatted: Some(session.formatted_time.clone()),
            error: (!delivered).then(|| SessionOutcome::DELIVERY_FAILED.to_string()),
        }
    }
}

/// Timing policy for scheduling
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub default_margin: Duration,
    pub max_margin: Duration,
    /// Reserved tail of the margin; delivery must finish before it starts
    pub safety_buffer: Duration,
    pub readiness_max_age: Duration,
    pub readiness_deadline: Duration,
    /// Finalize this long after `scheduled_epoch` even if acks are missing
    pub ack_timeout: Duration,
    /// Refuse margins the measured round trip cannot fit into
    pub rtt_guard: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_margin: Duration::from_millis(500),
            max_margin: Duration::from_secs(30),
            safety_buffer: Duration::from_millis(100),
            readiness_max_age: Duration::from_secs(2),
            readiness_deadline: Duration::from_secs(2),
            ack_timeout: Duration::from_secs(10),
            rtt_guard: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(ready: &[u32], armed: &[u32], confirmed: &[u32]) -> Session {
        Session {
            session_id: "capture_1_1".to_string(),
            scheduled_epoch: Utc::now(),
            capture_time: 0.0,
            formatted_time: String::new(),
            margin_ms: 500,
            ready_nodes: ready.to_vec(),
            armed_nodes: armed.to_vec(),
            dropped_nodes: ready.iter().filter(|id| !armed.contains(id)).copied().collect(),
            confirmed_nodes: confirmed.to_vec(),
            failed_nodes: Vec::new(),
            outcome: SessionOutcome::Pending,
            created_at: Utc::now(),
            finalized_at: None,
        }
    }

    #[test]
    fn test_outcome_rules() {
        assert_eq!(session(&[1, 3], &[1, 3], &[1, 3]).evaluate(), SessionOutcome::Success);
        assert_eq!(session(&[1, 3], &[1, 3], &[3]).evaluate(), SessionOutcome::Partial);
        // a dropped node keeps the session from being a full success
        assert_eq!(session(&[1, 3], &[1], &[1]).evaluate(), SessionOutcome::Partial);
        assert_eq!(
            session(&[1, 3], &[1, 3], &[]).evaluate(),
            SessionOutcome::Failure {
                reason: "no_confirmations".to_string()
            }
        );
        assert_eq!(
            session(&[1, 3], &[], &[]).evaluate(),
            SessionOutcome::Failure {
                reason: "delivery_failed".to_string()
            }
        );
    }

    #[test]
    fn test_outstanding_acks() {
        let mut s = session(&[1, 2, 3], &[1, 2, 3], &[2]);
        s.failed_nodes.push(3);
        assert_eq!(s.outstanding(), vec![1]);
        s.confirmed_nodes.push(1);
        assert!(s.all_acknowledged());
    }

    #[test]
    fn test_capture_result_wire_shape() {
        let json = serde_json::to_value(CaptureResult::failed("no_ready_nodes")).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "no_ready_nodes");
        assert!(json.get("session_id").is_none());

        let outcome = serde_json::to_value(SessionOutcome::Failure {
            reason: "delivery_failed".to_string(),
        })
        .unwrap();
        assert_eq!(outcome["status"], "failure");
        assert_eq!(outcome["reason"], "delivery_failed");
    }
}
