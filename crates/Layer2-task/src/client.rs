//! Client Façade - submit, cancel and await persistent tasks
//!
//! A client is bound to one node. Requests only succeed while that node
//! holds leadership; otherwise they fail fast with `NotLeader` carrying
//! the current leader as a hint, and the caller retries against it
//! (transport-level redirection is outside this crate).

use crate::coordinator::{CoordinatorHandle, CoordinatorLink, TaskOutcome};
use crate::directory::TaskId;
use crate::membership::{ClusterMembership, NodeId};
use serde_json::Value;
use std::sync::Arc;
use tether_foundation::{Error, Result};
use tokio::sync::oneshot;

/// Receives the terminal outcome of one task.
pub struct CompletionWaiter {
    rx: oneshot::Receiver<TaskOutcome>,
}

impl CompletionWaiter {
    /// Wait for the task to reach a terminal state. Errors when the
    /// leadership changed before the task finished; the task itself keeps
    /// running and can be awaited again via the new leader.
    pub async fn wait(self) -> Result<TaskOutcome> {
        self.rx.await.map_err(|_| Error::NotLeader { leader: None })
    }
}

/// API surface applications use to run persistent tasks.
#[derive(Clone)]
pub struct TaskClient {
    node_id: NodeId,
    membership: Arc<ClusterMembership>,
    link: Arc<CoordinatorLink>,
}

impl TaskClient {
    pub fn new(
        node_id: NodeId,
        membership: Arc<ClusterMembership>,
        link: Arc<CoordinatorLink>,
    ) -> Self {
        Self {
            node_id,
            membership,
            link,
        }
    }

    /// Submit a task for persistent execution. Returns its cluster-wide
    /// id; the task will run somewhere until it completes, fails
    /// terminally, or is cancelled.
    pub async fn submit(&self, action_type: impl Into<String>, payload: Value) -> Result<TaskId> {
        self.leader_handle()
            .await?
            .start_task(action_type, payload, None)
            .await
    }

    /// Submit and register a completion waiter in the same coordinator
    /// step, so the outcome cannot slip between submit and await.
    pub async fn submit_watched(
        &self,
        action_type: impl Into<String>,
        payload: Value,
    ) -> Result<(TaskId, CompletionWaiter)> {
        let (tx, rx) = oneshot::channel();
        let id = self
            .leader_handle()
            .await?
            .start_task(action_type, payload, Some(tx))
            .await?;
        Ok((id, CompletionWaiter { rx }))
    }

    /// Cancel a task. The record is pruned immediately; if a node is
    /// executing it, that node is signalled to stop.
    pub async fn cancel(&self, id: TaskId, reason: impl Into<String>) -> Result<()> {
        self.leader_handle().await?.cancel_task(id, reason).await
    }

    /// Wait for an existing task to reach a terminal state
    pub async fn await_completion(&self, id: TaskId) -> Result<TaskOutcome> {
        let rx = self.leader_handle().await?.await_completion(id).await?;
        CompletionWaiter { rx }.wait().await
    }

    async fn leader_handle(&self) -> Result<CoordinatorHandle> {
        let leader = self.membership.leader().await;
        if leader.as_ref() != Some(&self.node_id) {
            return Err(Error::NotLeader {
                leader: leader.map(|n| n.to_string()),
            });
        }
        self.link
            .handle()
            .ok_or(Error::NotLeader { leader: None })
    }
}
