//! SessionLog - Recorded Capture Sessions (Ring Buffer)
//!
//! ## Responsibilities
//!
//! - Keep the most recent finalized sessions, oldest evicted first
//! - Serve them most-recent-first
//!
//! Entries are never edited after append.

use crate::capture_scheduler::Session;
use std::collections::VecDeque;
use tokio::sync::RwLock;

/// Default number of sessions retained
pub const DEFAULT_CAPACITY: usize = 10;

struct SessionRing {
    sessions: VecDeque<Session>,
    capacity: usize,
    total_appended: u64,
}

impl SessionRing {
    fn new(capacity: usize) -> Self {
        Self {
            sessions: VecDeque::with_capacity(capacity),
            capacity,
            total_appended: 0,
        }
    }

    fn push(&mut self, session: Session) -> Option<Session> {
        self.total_appended += 1;
        let evicted = if self.sessions.len() >= self.capacity {
            self.sessions.pop_front()
        } else {
            None
        };
        self.sessions.push_back(session);
        evicted
    }
}

/// SessionLog instance
pub struct SessionLog {
    ring: RwLock<SessionRing>,
}

impl SessionLog {
    /// Create a log keeping at most `capacity` sessions (at least one)
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RwLock::new(SessionRing::new(capacity.max(1))),
        }
    }

    /// Append a finalized session
    pub async fn append(&self, session: Session) {
        let session_id = session.session_id.clone();
        let mut ring = self.ring.write().await;
        if let Some(evicted) = ring.push(session) {
            tracing::debug!(session_id = %evicted.session_id, "Session evicted from log");
        }
        tracing::debug!(session_id = %session_id, retained = ring.sessions.len(), "Session recorded");
    }

    /// All retained sessions, most recent first
    pub async fn list(&self) -> Vec<Session> {
        self.ring.read().await.sessions.iter().rev().cloned().collect()
    }

    pub async fn latest(&self) -> Option<Session> {
        self.ring.read().await.sessions.back().cloned()
    }

    pub async fn len(&self) -> usize {
        self.ring.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Sessions appended over the process lifetime, evicted ones included
    pub async fn total_appended(&self) -> u64 {
        self.ring.read().await.total_appended
    }
}

impl Default for SessionLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture_scheduler::SessionOutcome;
    use chrono::Utc;

    fn session(n: u32) -> Session {
        Session {
            session_id: format!("capture_{}", n),
            scheduled_epoch: Utc::now(),
            capture_time: n as f64,
            formatted_time: String::new(),
            margin_ms: 500,
            ready_nodes: vec![1],
            armed_nodes: vec![1],
            dropped_nodes: Vec::new(),
            confirmed_nodes: vec![1],
            failed_nodes: Vec::new(),
            outcome: SessionOutcome::Success,
            created_at: Utc::now(),
            finalized_at: Some(Utc::now()),
        }
    }

    #[tokio::test]
    async fn test_list_is_most_recent_first() {
        let log = SessionLog::default();
        for n in 1..=3 {
            log.append(session(n)).await;
        }
        let ids: Vec<String> = log.list().await.into_iter().map(|s| s.session_id).collect();
        assert_eq!(ids, vec!["capture_3", "capture_2", "capture_1"]);
        assert_eq!(log.latest().await.unwrap().session_id, "capture_3");
    }

    #[tokio::test]
    async fn test_oldest_evicted_at_capacity() {
        let log = SessionLog::default();
        for n in 1..=12 {
            log.append(session(n)).await;
        }
        let list = log.list().await;
        assert_eq!(list.len(), DEFAULT_CAPACITY);
        assert_eq!(list.first().unwrap().session_id, "capture_12");
        assert_eq!(list.last().unwrap().session_id, "capture_3");
        assert_eq!(log.total_appended().await, 12);
    }

    #[tokio::test]
    async fn test_zero_capacity_keeps_one() {
        let log = SessionLog::new(0);
        log.append(session(1)).await;
        log.append(session(2)).await;
        assert_eq!(log.len().await, 1);
        assert!(!log.is_empty().await);
    }
}
