//! Cluster membership boundary
//!
//! The coordination core consumes membership through a narrow surface:
//! "am I leader", "which nodes are alive and what do they advertise",
//! and a stream of join/leave/leadership events. Election itself is an
//! external concern; the in-process implementation here makes it explicit
//! (`elect`) so embeddings and tests drive it directly.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tether_foundation::{Error, Result};
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

// ============================================================================
// NodeId
// ============================================================================

/// Unique node identifier, ordered for deterministic tie-breaking
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ============================================================================
// NodeInfo
// ============================================================================

/// What a node advertises to the cluster: which action types it can run,
/// which executor pools it carries, and their capacities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,

    /// Advertised action types and the executor pool each runs in
    pub actions: BTreeMap<String, String>,

    /// Executor pools and their capacity (max concurrently owned tasks)
    pub pools: BTreeMap<String, usize>,
}

impl NodeInfo {
    pub fn new(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            actions: BTreeMap::new(),
            pools: BTreeMap::new(),
        }
    }

    pub fn with_action(mut self, action_type: impl Into<String>, pool: impl Into<String>) -> Self {
        self.actions.insert(action_type.into(), pool.into());
        self
    }

    pub fn with_pool(mut self, pool: impl Into<String>, capacity: usize) -> Self {
        self.pools.insert(pool.into(), capacity);
        self
    }

    pub fn advertises_action(&self, action_type: &str) -> bool {
        self.actions.contains_key(action_type)
    }

    /// Pool the advertised action runs in, if this node advertises it
    pub fn pool_for_action(&self, action_type: &str) -> Option<&str> {
        self.actions.get(action_type).map(String::as_str)
    }

    pub fn pool_capacity(&self, pool: &str) -> usize {
        self.pools.get(pool).copied().unwrap_or(0)
    }
}

// ============================================================================
// MembershipEvent
// ============================================================================

/// Membership change notification
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    NodeJoined(NodeId),
    NodeLeft(NodeId),
    LeaderChanged(Option<NodeId>),
}

// ============================================================================
// ClusterMembership
// ============================================================================

#[derive(Debug, Default)]
struct MembershipState {
    nodes: BTreeMap<NodeId, NodeInfo>,
    leader: Option<NodeId>,
}

/// In-process membership and leader-election service.
///
/// One writer discipline per mutation (the async RwLock), many readers;
/// consumers that need ordering subscribe to the event stream.
pub struct ClusterMembership {
    state: RwLock<MembershipState>,
    events: broadcast::Sender<MembershipEvent>,
}

impl ClusterMembership {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: RwLock::new(MembershipState::default()),
            events,
        }
    }

    /// Add a node, or refresh its advertisement if already present
    pub async fn join(&self, info: NodeInfo) {
        let id = info.id.clone();
        let rejoined = {
            let mut state = self.state.write().await;
            state.nodes.insert(id.clone(), info).is_some()
        };

        if rejoined {
            info!(node = %id, "Node advertisement refreshed");
        } else {
            info!(node = %id, "Node joined cluster");
        }
        let _ = self.events.send(MembershipEvent::NodeJoined(id));
    }

    /// Remove a node. If it was the leader, leadership is vacated first.
    pub async fn leave(&self, id: &NodeId) -> bool {
        let (removed, lost_leader) = {
            let mut state = self.state.write().await;
            let removed = state.nodes.remove(id).is_some();
            let lost_leader = removed && state.leader.as_ref() == Some(id);
            if lost_leader {
                state.leader = None;
            }
            (removed, lost_leader)
        };

        if removed {
            info!(node = %id, "Node left cluster");
            if lost_leader {
                warn!(node = %id, "Leader left cluster; leadership vacated");
                let _ = self.events.send(MembershipEvent::LeaderChanged(None));
            }
            let _ = self.events.send(MembershipEvent::NodeLeft(id.clone()));
        }
        removed
    }

    /// Make the given live node the leader
    pub async fn elect(&self, id: &NodeId) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if !state.nodes.contains_key(id) {
                return Err(Error::InvalidInput(format!(
                    "cannot elect unknown node {}",
                    id
                )));
            }
            if state.leader.as_ref() == Some(id) {
                return Ok(());
            }
            state.leader = Some(id.clone());
        }

        info!(node = %id, "Leader elected");
        let _ = self
            .events
            .send(MembershipEvent::LeaderChanged(Some(id.clone())));
        Ok(())
    }

    pub async fn leader(&self) -> Option<NodeId> {
        self.state.read().await.leader.clone()
    }

    pub async fn is_leader(&self, id: &NodeId) -> bool {
        self.state.read().await.leader.as_ref() == Some(id)
    }

    /// Advertisements of all live nodes, in node-id order
    pub async fn nodes(&self) -> Vec<NodeInfo> {
        self.state.read().await.nodes.values().cloned().collect()
    }

    pub async fn get(&self, id: &NodeId) -> Option<NodeInfo> {
        self.state.read().await.nodes.get(id).cloned()
    }

    pub async fn contains(&self, id: &NodeId) -> bool {
        self.state.read().await.nodes.contains_key(id)
    }

    /// Whether any live node advertises the action type, and in which pool
    pub async fn pool_for_action(&self, action_type: &str) -> Option<String> {
        let state = self.state.read().await;
        state
            .nodes
            .values()
            .find_map(|n| n.pool_for_action(action_type).map(str::to_string))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }
}

impl Default for ClusterMembership {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
