//! Task Cluster - in-process wiring of the coordination core
//!
//! Hosts the membership service, the node services, and whichever node's
//! coordinator currently holds the pen. This is the embedding surface for
//! applications running the core inside their own process, and the
//! harness the demo binary and integration tests drive.
//!
//! Leadership moves explicitly through [`TaskCluster::elect`]; the
//! previous coordinator is always drained before the next one spawns, so
//! there is never more than one writer.

use crate::assign::{AssignmentPolicy, LowestNodeId};
use crate::client::TaskClient;
use crate::coordinator::{CoordinatorHandle, CoordinatorLink, DirectoryCoordinator};
use crate::directory::{DirectoryPublisher, TaskDirectory, TaskId};
use crate::membership::{ClusterMembership, NodeId, NodeInfo};
use crate::node::{NodeService, NodeServiceHandle};
use crate::registry::ActionRegistry;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tether_foundation::{
    ClusterEvent, Error, EventBus, EventCategory, EventSeverity, NodeConfig, Result,
};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::info;

struct NodeEntry {
    service: NodeServiceHandle,
    registry: Arc<ActionRegistry>,
    config: NodeConfig,
}

/// An in-process cluster of task-coordination nodes.
pub struct TaskCluster {
    membership: Arc<ClusterMembership>,
    publisher: DirectoryPublisher,
    events: Arc<EventBus>,
    policy: Arc<dyn AssignmentPolicy>,
    link: Arc<CoordinatorLink>,
    nodes: RwLock<HashMap<NodeId, NodeEntry>>,
    coordinator: Mutex<Option<(NodeId, CoordinatorHandle)>>,
}

impl TaskCluster {
    /// Create a cluster with the default assignment policy
    pub fn new() -> Self {
        Self::with_policy(Arc::new(LowestNodeId))
    }

    pub fn with_policy(policy: Arc<dyn AssignmentPolicy>) -> Self {
        Self {
            membership: Arc::new(ClusterMembership::new()),
            publisher: DirectoryPublisher::new(),
            events: Arc::new(EventBus::new()),
            policy,
            link: Arc::new(CoordinatorLink::new()),
            nodes: RwLock::new(HashMap::new()),
            coordinator: Mutex::new(None),
        }
    }

    /// Start a node service and announce it to the cluster. The node
    /// advertises the actions its registry holds plus the pools from its
    /// config.
    pub async fn start_node(
        &self,
        config: NodeConfig,
        registry: Arc<ActionRegistry>,
    ) -> Result<NodeId> {
        let id = NodeId::new(config.node_id.clone());

        {
            let nodes = self.nodes.read().await;
            if nodes.contains_key(&id) {
                return Err(Error::InvalidInput(format!(
                    "node {} is already running",
                    id
                )));
            }
        }

        let service = NodeService::spawn(
            id.clone(),
            Arc::clone(&registry),
            Arc::clone(&self.link),
            self.publisher.subscribe(),
            Arc::clone(&self.events),
        );

        let mut info = NodeInfo::new(id.clone());
        for (action, pool) in registry.advertised_actions() {
            info = info.with_action(action, pool);
        }
        for (pool, capacity) in &config.pools {
            info = info.with_pool(pool.clone(), *capacity);
        }

        // Attach before joining so the coordinator can signal the node as
        // soon as it starts assigning to it.
        if let Some((_, coordinator)) = self.coordinator.lock().await.as_ref() {
            coordinator.attach_node(id.clone(), service.signal_sender());
        }

        self.nodes.write().await.insert(
            id.clone(),
            NodeEntry {
                service,
                registry,
                config,
            },
        );
        self.membership.join(info).await;

        self.publish_membership_event("membership.node_joined", &id).await;
        Ok(id)
    }

    /// Refresh a node's advertisement with an extra action claim.
    /// Exercises registration skew: the cluster may believe a node can
    /// run an action its local registry does not actually hold.
    pub async fn advertise_action(
        &self,
        id: &NodeId,
        action_type: impl Into<String>,
        pool: impl Into<String>,
    ) -> Result<()> {
        let info = self
            .membership
            .get(id)
            .await
            .ok_or_else(|| Error::InvalidInput(format!("unknown node {}", id)))?;
        self.membership
            .join(info.with_action(action_type, pool))
            .await;
        Ok(())
    }

    /// Stop a node. Its locally running tasks die with it; the leader
    /// observes the departure and reassigns what the node owned.
    pub async fn stop_node(&self, id: &NodeId) -> Result<()> {
        let entry = self
            .nodes
            .write()
            .await
            .remove(id)
            .ok_or_else(|| Error::InvalidInput(format!("unknown node {}", id)))?;

        // If the departing node was the leader, drain its coordinator
        // before announcing the departure.
        {
            let mut coordinator = self.coordinator.lock().await;
            let was_leader =
                matches!(coordinator.as_ref(), Some((leader_id, _)) if leader_id == id);
            if was_leader {
                if let Some((_, handle)) = coordinator.take() {
                    handle.shutdown().await;
                }
                self.link.clear_handle();
            } else if let Some((_, handle)) = coordinator.as_ref() {
                handle.detach_node(id.clone());
            }
        }

        entry.service.stop().await;
        self.membership.leave(id).await;

        self.publish_membership_event("membership.node_left", id).await;
        Ok(())
    }

    /// Move leadership to the given live node. The old coordinator is
    /// drained first; the new one resumes from the last published
    /// directory version.
    pub async fn elect(&self, id: &NodeId) -> Result<()> {
        if !self.nodes.read().await.contains_key(id) {
            return Err(Error::InvalidInput(format!("unknown node {}", id)));
        }

        let mut coordinator = self.coordinator.lock().await;

        if let Some((old_id, old)) = coordinator.take() {
            if &old_id == id {
                *coordinator = Some((old_id, old));
                return Ok(());
            }
            old.shutdown().await;
            self.link.clear_handle();
        }

        self.membership.elect(id).await?;

        let handle = DirectoryCoordinator::spawn(
            id.clone(),
            Arc::clone(&self.membership),
            Arc::clone(&self.policy),
            self.publisher.clone(),
            Arc::clone(&self.events),
        );

        {
            let nodes = self.nodes.read().await;
            for (node_id, entry) in nodes.iter() {
                handle.attach_node(node_id.clone(), entry.service.signal_sender());
            }
        }

        self.link.set_handle(handle.clone());
        *coordinator = Some((id.clone(), handle));

        info!(node = %id, "Coordinator active on new leader");
        self.publish_membership_event("membership.leader_elected", id).await;
        Ok(())
    }

    /// Client bound to the given node
    pub async fn client(&self, id: &NodeId) -> Result<TaskClient> {
        if !self.nodes.read().await.contains_key(id) {
            return Err(Error::InvalidInput(format!("unknown node {}", id)));
        }
        Ok(TaskClient::new(
            id.clone(),
            Arc::clone(&self.membership),
            Arc::clone(&self.link),
        ))
    }

    pub async fn leader(&self) -> Option<NodeId> {
        self.membership.leader().await
    }

    /// Latest published directory snapshot
    pub fn directory(&self) -> Arc<TaskDirectory> {
        self.publisher.latest()
    }

    pub fn subscribe_directory(&self) -> watch::Receiver<Arc<TaskDirectory>> {
        self.publisher.subscribe()
    }

    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    pub fn membership(&self) -> Arc<ClusterMembership> {
        Arc::clone(&self.membership)
    }

    /// Task ids with a live Execution Handle on the given node
    pub async fn running_tasks(&self, id: &NodeId) -> Result<Vec<TaskId>> {
        let nodes = self.nodes.read().await;
        let entry = nodes
            .get(id)
            .ok_or_else(|| Error::InvalidInput(format!("unknown node {}", id)))?;
        Ok(entry.service.running_tasks())
    }

    /// Registry of a running node (for late registrations)
    pub async fn registry(&self, id: &NodeId) -> Result<Arc<ActionRegistry>> {
        let nodes = self.nodes.read().await;
        let entry = nodes
            .get(id)
            .ok_or_else(|| Error::InvalidInput(format!("unknown node {}", id)))?;
        Ok(Arc::clone(&entry.registry))
    }

    /// Stop the coordinator and every node
    pub async fn shutdown(&self) {
        {
            let mut coordinator = self.coordinator.lock().await;
            if let Some((_, handle)) = coordinator.take() {
                handle.shutdown().await;
            }
            self.link.clear_handle();
        }

        let entries: Vec<NodeEntry> = {
            let mut nodes = self.nodes.write().await;
            nodes.drain().map(|(_, e)| e).collect()
        };
        futures::future::join_all(entries.iter().map(|entry| entry.service.stop())).await;
        for entry in entries {
            self.membership.leave(&NodeId::new(entry.config.node_id)).await;
        }
        info!("Cluster shut down");
    }

    async fn publish_membership_event(&self, event_type: &str, node: &NodeId) {
        self.events
            .publish(
                ClusterEvent::new(event_type, EventCategory::Membership)
                    .with_source(node.as_str().to_string())
                    .with_severity(EventSeverity::Info)
                    .with_payload(json!({ "node": node.as_str() })),
            )
            .await;
    }
}

impl Default for TaskCluster {
    fn default() -> Self {
        Self::new()
    }
}
