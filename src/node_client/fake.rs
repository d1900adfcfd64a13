//! Scriptable in-process NodeClient for unit tests

use super::{CaptureCommand, NodeClient, StreamProbe};
use crate::error::{Error, Result};
use crate::node_registry::Node;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// How a fake node answers
#[derive(Debug, Clone)]
pub enum Behavior {
    Ready,
    NotReady,
    /// Answers ready after the delay
    Slow(Duration),
    Unreachable,
}

#[derive(Default)]
pub struct FakeNodeClient {
    ready: Mutex<HashMap<u32, Behavior>>,
    capture: Mutex<HashMap<u32, Behavior>>,
    delivered: Mutex<Vec<(u32, CaptureCommand)>>,
}

impl FakeNodeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, node_id: u32, behavior: Behavior) {
        self.ready.lock().unwrap().insert(node_id, behavior);
    }

    pub fn set_capture(&self, node_id: u32, behavior: Behavior) {
        self.capture.lock().unwrap().insert(node_id, behavior);
    }

    pub fn delivered(&self) -> Vec<(u32, CaptureCommand)> {
        self.delivered.lock().unwrap().clone()
    }

    async fn answer(behavior: Option<Behavior>) -> Result<bool> {
        match behavior.unwrap_or(Behavior::Ready) {
            Behavior::Ready => Ok(true),
            Behavior::NotReady => Ok(false),
            Behavior::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(true)
            }
            Behavior::Unreachable => Err(Error::Network("connection refused".to_string())),
        }
    }
}

#[async_trait]
impl NodeClient for FakeNodeClient {
    async fn query_ready(&self, node: &Node) -> Result<bool> {
        let behavior = self.ready.lock().unwrap().get(&node.node_id).cloned();
        Self::answer(behavior).await
    }

    async fn send_capture(&self, node: &Node, command: &CaptureCommand) -> Result<bool> {
        let behavior = self.capture.lock().unwrap().get(&node.node_id).cloned();
        let armed = Self::answer(behavior).await?;
        if armed {
            self.delivered
                .lock()
                .unwrap()
                .push((node.node_id, command.clone()));
        }
        Ok(armed)
    }

    async fn probe_stream(&self, _node: &Node, _timeout: Duration) -> StreamProbe {
        StreamProbe::Unavailable("fake node has no stream".to_string())
    }
}
