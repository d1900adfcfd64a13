//! NodeRegistry - Authoritative Camera Node Table
//!
//! ## Responsibilities
//!
//! - Admit nodes and assign stable small-integer ids
//! - Track status / readiness / liveness per node
//! - Track the active view (node shown in operator live preview)
//! - Emit a change event after every mutation
//!
//! ## Design
//!
//! - Single writer: every mutation takes the one write lock, so readers
//!   always see a whole node, never a half-applied update
//! - Readers get cloned snapshots ordered by node_id
//! - `is_ready` is forced false whenever status leaves `Online`

mod types;

pub use types::*;

use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Change channel depth; slow subscribers see `Lagged` and resync from a snapshot
const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct RegistryInner {
    nodes: BTreeMap<u32, Node>,
    identities: HashMap<String, u32>,
    active_view: Option<u32>,
    /// Bumped on every admission and status transition
    generation: u64,
}

impl RegistryInner {
    fn next_free_id(&self) -> u32 {
        (1..).find(|id| !self.nodes.contains_key(id)).unwrap_or(u32::MAX)
    }

    fn lowest_online(&self) -> Option<u32> {
        self.nodes
            .values()
            .find(|n| n.is_online())
            .map(|n| n.node_id)
    }

    /// Give the view to `node_id` if nobody holds it. Returns true if assigned.
    fn claim_view_if_unset(&mut self, node_id: u32) -> bool {
        if self.active_view.is_some() {
            return false;
        }
        self.active_view = Some(node_id);
        true
    }

    /// Apply a status transition, keeping the readiness invariant and the
    /// active view consistent. Returns the previous status if it changed.
    fn transition(&mut self, node_id: u32, to: NodeStatus) -> Option<NodeStatus> {
        let node = self.nodes.get_mut(&node_id)?;
        let from = node.status;
        if to != NodeStatus::Online {
            node.is_ready = false;
        }
        if from == to {
            return None;
        }
        node.status = to;
        self.generation += 1;

        if to == NodeStatus::Offline && self.active_view == Some(node_id) {
            self.active_view = self.lowest_online();
        }
        Some(from)
    }
}

/// NodeRegistry instance
pub struct NodeRegistry {
    inner: RwLock<RegistryInner>,
    changes: broadcast::Sender<RegistryChange>,
}

impl NodeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(RegistryInner::default()),
            changes,
        }
    }

    /// Subscribe to change events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryChange> {
        self.changes.subscribe()
    }

    fn emit(&self, change: RegistryChange) {
        // No subscribers is fine (startup, tests)
        let _ = self.changes.send(change);
    }

    /// Register a node
    ///
    /// A returning identity keeps its node_id; a new (or absent) identity
    /// gets the lowest unused id and a freshly minted identity token.
    pub async fn register(
        &self,
        identity: Option<String>,
        address: NodeAddress,
        capabilities: NodeCapabilities,
    ) -> Registration {
        let now = Utc::now();
        let mut inner = self.inner.write().await;

        let known = identity
            .as_ref()
            .and_then(|token| inner.identities.get(token).copied());

        let registration = match known {
            Some(node_id) => {
                let previous = inner.transition(node_id, NodeStatus::Online);
                if let Some(node) = inner.nodes.get_mut(&node_id) {
                    node.address = address;
                    node.capabilities = capabilities;
                    node.last_heartbeat = now;
                    node.is_ready = false;
                }
                tracing::info!(
                    node_id = node_id,
                    previous_status = ?previous,
                    "Node re-registered with known identity"
                );
                Registration {
                    node_id,
                    identity: identity.unwrap_or_default(),
                    reconnected: true,
                }
            }
            None => {
                let node_id = inner.next_free_id();
                let identity = identity.unwrap_or_else(|| Uuid::new_v4().to_string());
                tracing::info!(
                    node_id = node_id,
                    host = %address.host,
                    port = address.port,
                    "New node registered"
                );
                inner.identities.insert(identity.clone(), node_id);
                inner.nodes.insert(
                    node_id,
                    Node {
                        node_id,
                        identity: identity.clone(),
                        address,
                        status: NodeStatus::Online,
                        is_ready: false,
                        last_heartbeat: now,
                        capabilities,
                    },
                );
                Registration {
                    node_id,
                    identity,
                    reconnected: false,
                }
            }
        };

        inner.generation += 1;
        let view_assigned = inner.claim_view_if_unset(registration.node_id);
        drop(inner);

        self.emit(RegistryChange::Registered {
            node_id: registration.node_id,
            reconnected: registration.reconnected,
        });
        if view_assigned {
            self.emit(RegistryChange::ViewSwitched {
                node_id: Some(registration.node_id),
            });
        }
        registration
    }

    /// Bring back a node that presents a node_id it was assigned earlier
    /// (e.g. after a coordinator restart lost the table)
    ///
    /// A known id is refreshed and marked online. An unknown id is admitted
    /// under that id with the given (or a minted) identity.
    pub async fn restore(
        &self,
        node_id: u32,
        identity: Option<String>,
        address: NodeAddress,
        capabilities: NodeCapabilities,
    ) -> Result<Registration> {
        if node_id == 0 {
            return Err(Error::Validation("node_id must be positive".to_string()));
        }

        let now = Utc::now();
        let mut inner = self.inner.write().await;

        if let Some(token) = &identity {
            if let Some(&owner) = inner.identities.get(token) {
                if owner != node_id {
                    return Err(Error::Validation(format!(
                        "identity already belongs to node {}",
                        owner
                    )));
                }
            }
        }

        let reconnected = inner.nodes.contains_key(&node_id);
        let identity = if reconnected {
            inner.transition(node_id, NodeStatus::Online);
            let node = inner
                .nodes
                .get_mut(&node_id)
                .ok_or(Error::UnknownNode(node_id))?;
            node.address = address;
            node.capabilities = capabilities;
            node.last_heartbeat = now;
            node.is_ready = false;
            node.identity.clone()
        } else {
            let identity = identity.unwrap_or_else(|| Uuid::new_v4().to_string());
            inner.identities.insert(identity.clone(), node_id);
            inner.nodes.insert(
                node_id,
                Node {
                    node_id,
                    identity: identity.clone(),
                    address,
                    status: NodeStatus::Online,
                    is_ready: false,
                    last_heartbeat: now,
                    capabilities,
                },
            );
            identity
        };

        inner.generation += 1;
        let view_assigned = inner.claim_view_if_unset(node_id);
        drop(inner);

        tracing::info!(node_id = node_id, reconnected = reconnected, "Node back online");
        self.emit(RegistryChange::Registered {
            node_id,
            reconnected,
        });
        if view_assigned {
            self.emit(RegistryChange::ViewSwitched {
                node_id: Some(node_id),
            });
        }

        Ok(Registration {
            node_id,
            identity,
            reconnected,
        })
    }

    /// Update a node's status or readiness
    pub async fn update(&self, node_id: u32, update: NodeUpdate) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.nodes.contains_key(&node_id) {
            return Err(Error::UnknownNode(node_id));
        }

        let change = match update {
            NodeUpdate::Status(to) => {
                let was_ready = inner.nodes.get(&node_id).is_some_and(|n| n.is_ready);
                match inner.transition(node_id, to) {
                    Some(from) => Some(RegistryChange::StatusChanged { node_id, from, to }),
                    None if was_ready && to != NodeStatus::Online => {
                        Some(RegistryChange::ReadinessChanged {
                            node_id,
                            is_ready: false,
                        })
                    }
                    None => None,
                }
            }
            NodeUpdate::Ready(ready) => {
                let node = inner
                    .nodes
                    .get_mut(&node_id)
                    .ok_or(Error::UnknownNode(node_id))?;
                let effective = ready && node.is_online();
                if node.is_ready != effective {
                    node.is_ready = effective;
                    Some(RegistryChange::ReadinessChanged {
                        node_id,
                        is_ready: effective,
                    })
                } else {
                    None
                }
            }
        };
        drop(inner);

        if let Some(change) = change {
            tracing::debug!(node_id = node_id, change = ?change, "Node updated");
            self.emit(change);
        }
        Ok(())
    }

    /// Record a heartbeat
    ///
    /// An offline (or errored) node comes back online with `is_ready = false`;
    /// the readiness hint is only honoured for a node that was already online.
    pub async fn heartbeat(&self, node_id: u32, ready_hint: Option<bool>) -> Result<HeartbeatEffect> {
        let mut inner = self.inner.write().await;
        let node = inner
            .nodes
            .get_mut(&node_id)
            .ok_or(Error::UnknownNode(node_id))?;
        node.last_heartbeat = Utc::now();

        match node.status {
            NodeStatus::Offline | NodeStatus::Error => {
                let from = node.status;
                node.status = NodeStatus::Online;
                node.is_ready = false;
                inner.generation += 1;
                let view_assigned = inner.claim_view_if_unset(node_id);
                drop(inner);

                tracing::info!(node_id = node_id, from = %from, "Node recovered on heartbeat");
                self.emit(RegistryChange::StatusChanged {
                    node_id,
                    from,
                    to: NodeStatus::Online,
                });
                if view_assigned {
                    self.emit(RegistryChange::ViewSwitched {
                        node_id: Some(node_id),
                    });
                }
                Ok(HeartbeatEffect::Recovered)
            }
            NodeStatus::Online => {
                let change = match ready_hint {
                    Some(ready) if ready != node.is_ready => {
                        node.is_ready = ready;
                        Some(RegistryChange::ReadinessChanged {
                            node_id,
                            is_ready: ready,
                        })
                    }
                    _ => None,
                };
                drop(inner);

                if let Some(change) = change {
                    self.emit(change);
                }
                Ok(HeartbeatEffect::Refreshed)
            }
            NodeStatus::Capturing => Ok(HeartbeatEffect::Refreshed),
        }
    }

    /// Mark a node offline. Returns true if this call made the transition.
    pub async fn mark_offline(&self, node_id: u32) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if !inner.nodes.contains_key(&node_id) {
            return Err(Error::UnknownNode(node_id));
        }
        let view_before = inner.active_view;
        let previous = inner.transition(node_id, NodeStatus::Offline);
        let view_after = inner.active_view;
        drop(inner);

        match previous {
            Some(from) => {
                tracing::warn!(node_id = node_id, from = %from, "Node marked offline");
                self.emit(RegistryChange::StatusChanged {
                    node_id,
                    from,
                    to: NodeStatus::Offline,
                });
                if view_after != view_before {
                    self.emit(RegistryChange::ViewSwitched {
                        node_id: view_after,
                    });
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Transition every node silent for longer than `timeout` to offline
    ///
    /// Returns the ids that transitioned on this call; a node already
    /// offline is never reported twice.
    pub async fn expire_silent(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<u32> {
        let mut inner = self.inner.write().await;
        let silent: Vec<u32> = inner
            .nodes
            .values()
            .filter(|n| n.status != NodeStatus::Offline && now - n.last_heartbeat > timeout)
            .map(|n| n.node_id)
            .collect();

        let view_before = inner.active_view;
        let mut expired = Vec::with_capacity(silent.len());
        let mut changes = Vec::with_capacity(silent.len() + 1);
        for node_id in silent {
            if let Some(from) = inner.transition(node_id, NodeStatus::Offline) {
                expired.push(node_id);
                changes.push(RegistryChange::StatusChanged {
                    node_id,
                    from,
                    to: NodeStatus::Offline,
                });
            }
        }
        if inner.active_view != view_before {
            changes.push(RegistryChange::ViewSwitched {
                node_id: inner.active_view,
            });
        }
        drop(inner);

        for change in changes {
            self.emit(change);
        }
        expired
    }

    /// Overwrite readiness flags from a readiness poll in one write
    ///
    /// Nodes missing from the map are left untouched; a `true` for a node
    /// that is not online is stored as `false`.
    pub async fn apply_readiness(&self, ready: &BTreeMap<u32, bool>) {
        let mut inner = self.inner.write().await;
        for (node_id, is_ready) in ready {
            if let Some(node) = inner.nodes.get_mut(node_id) {
                node.is_ready = *is_ready && node.is_online();
            }
        }
        drop(inner);
        self.emit(RegistryChange::ReadinessRefreshed);
    }

    /// Move the given nodes from online-and-ready to `Capturing` in one write
    ///
    /// Returns the nodes actually claimed, ascending by node_id. A node that
    /// is not online, has not asserted readiness, or is already capturing
    /// for another session is skipped.
    pub async fn claim_for_capture(&self, node_ids: &[u32]) -> Vec<Node> {
        let mut inner = self.inner.write().await;
        let eligible: Vec<u32> = node_ids
            .iter()
            .copied()
            .filter(|id| {
                inner
                    .nodes
                    .get(id)
                    .is_some_and(|n| n.is_online() && n.is_ready)
            })
            .collect();

        let mut claimed = Vec::with_capacity(eligible.len());
        let mut changes = Vec::with_capacity(eligible.len());
        for node_id in eligible {
            if let Some(from) = inner.transition(node_id, NodeStatus::Capturing) {
                changes.push(RegistryChange::StatusChanged {
                    node_id,
                    from,
                    to: NodeStatus::Capturing,
                });
                if let Some(node) = inner.nodes.get(&node_id) {
                    claimed.push(node.clone());
                }
            }
        }
        drop(inner);

        claimed.sort_by_key(|n| n.node_id);
        for change in changes {
            self.emit(change);
        }
        claimed
    }

    /// Counter that moves whenever a node is admitted or changes status
    ///
    /// Readiness observed under one generation is stale under any later one.
    pub async fn generation(&self) -> u64 {
        self.inner.read().await.generation
    }

    /// Snapshot plus the generation it was taken at, under one read lock
    pub async fn snapshot_with_generation(&self) -> (Vec<Node>, u64) {
        let inner = self.inner.read().await;
        (inner.nodes.values().cloned().collect(), inner.generation)
    }

    /// Ordered snapshot of every node, ascending by node_id
    pub async fn snapshot(&self) -> Vec<Node> {
        self.inner.read().await.nodes.values().cloned().collect()
    }

    /// Snapshot plus derived counts, taken under one read lock
    pub async fn snapshot_with_counts(&self) -> (Vec<Node>, RegistryCounts) {
        let nodes = self.snapshot().await;
        let counts = RegistryCounts::from_nodes(&nodes);
        (nodes, counts)
    }

    /// Get a single node
    pub async fn get(&self, node_id: u32) -> Option<Node> {
        self.inner.read().await.nodes.get(&node_id).cloned()
    }

    /// Nodes currently online
    pub async fn online_nodes(&self) -> Vec<Node> {
        self.inner
            .read()
            .await
            .nodes
            .values()
            .filter(|n| n.is_online())
            .cloned()
            .collect()
    }

    pub async fn counts(&self) -> RegistryCounts {
        RegistryCounts::from_nodes(&self.snapshot().await)
    }

    /// Switch the active view. Only online nodes can be selected.
    pub async fn switch_view(&self, node_id: u32) -> bool {
        let mut inner = self.inner.write().await;
        let selectable = inner.nodes.get(&node_id).is_some_and(|n| n.is_online());
        if !selectable {
            return false;
        }
        inner.active_view = Some(node_id);
        drop(inner);

        tracing::info!(node_id = node_id, "Active view switched");
        self.emit(RegistryChange::ViewSwitched {
            node_id: Some(node_id),
        });
        true
    }

    pub async fn active_view(&self) -> Option<u32> {
        self.inner.read().await.active_view
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
