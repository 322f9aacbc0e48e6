//! Node Service - the per-node reconciliation loop
//!
//! Every node runs exactly one node service. It watches directory
//! publications, diffs the latest snapshot against the locally running
//! executions, and starts or cancels Execution Handles to close the gap.
//! Reports back to the coordinator are fire-and-forget sends that never
//! block reconciliation.

use crate::coordinator::{CoordinatorLink, NodeSignal};
use crate::directory::{TaskDirectory, TaskId, TaskRecord, TaskStatus};
use crate::handle::{CancellationToken, ExecutionHandle, TaskCompletion};
use crate::membership::NodeId;
use crate::registry::ActionRegistry;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tether_foundation::{ClusterEvent, EventBus, EventCategory, EventSeverity};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ============================================================================
// Reconciliation diff
// ============================================================================

/// What one reconciliation pass has to do
#[derive(Debug, Default, PartialEq, Eq)]
struct ReconcilePlan {
    to_start: Vec<TaskId>,
    to_cancel: Vec<TaskId>,
}

/// Pure diff of the directory against the locally running set.
///
/// Start: tasks this node owns, in an active state, with no local handle.
/// Cancel: local handles whose record is gone, owned elsewhere, or removed.
fn diff(directory: &TaskDirectory, me: &NodeId, running: &[TaskId]) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();

    for record in directory.tasks() {
        if record.is_owned_by(me) && record.status.is_active() && !running.contains(&record.id) {
            plan.to_start.push(record.id);
        }
    }

    for id in running {
        let stale = match directory.get(*id) {
            None => true,
            Some(record) => !record.is_owned_by(me) || record.status == TaskStatus::Removed,
        };
        if stale {
            plan.to_cancel.push(*id);
        }
    }

    plan
}

// ============================================================================
// NodeService
// ============================================================================

type RunningMap = Arc<Mutex<HashMap<TaskId, ExecutionHandle>>>;

/// Handle to a spawned node service
pub struct NodeServiceHandle {
    node_id: NodeId,
    signals_tx: mpsc::UnboundedSender<NodeSignal>,
    running: RunningMap,
    shutdown: CancellationToken,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl NodeServiceHandle {
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Sender the coordinator uses for out-of-band signals to this node
    pub fn signal_sender(&self) -> mpsc::UnboundedSender<NodeSignal> {
        self.signals_tx.clone()
    }

    /// Task ids with a live Execution Handle on this node
    pub fn running_tasks(&self) -> Vec<TaskId> {
        self.running.lock().keys().copied().collect()
    }

    pub fn has_task(&self, id: TaskId) -> bool {
        self.running.lock().contains_key(&id)
    }

    /// Stop the service and cancel everything it is running
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let join = self.join.lock().take();
        if let Some(join) = join {
            let _ = join.await;
        }
    }
}

/// The reconciliation actor. See module docs.
pub struct NodeService;

impl NodeService {
    pub fn spawn(
        node_id: NodeId,
        registry: Arc<ActionRegistry>,
        link: Arc<CoordinatorLink>,
        directory_rx: watch::Receiver<Arc<TaskDirectory>>,
        events: Arc<EventBus>,
    ) -> NodeServiceHandle {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let running: RunningMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        let runner = NodeRunner {
            node_id: node_id.clone(),
            registry,
            link,
            directory_rx,
            signals: signals_rx,
            completions_rx,
            completions_tx,
            running: Arc::clone(&running),
            last_seen_version: 0,
            shutdown: shutdown.clone(),
            events,
        };
        let join = tokio::spawn(runner.run());

        NodeServiceHandle {
            node_id,
            signals_tx,
            running,
            shutdown,
            join: Mutex::new(Some(join)),
        }
    }
}

struct NodeRunner {
    node_id: NodeId,
    registry: Arc<ActionRegistry>,
    link: Arc<CoordinatorLink>,
    directory_rx: watch::Receiver<Arc<TaskDirectory>>,
    signals: mpsc::UnboundedReceiver<NodeSignal>,
    completions_rx: mpsc::UnboundedReceiver<TaskCompletion>,
    completions_tx: mpsc::UnboundedSender<TaskCompletion>,
    running: RunningMap,
    last_seen_version: u64,
    shutdown: CancellationToken,
    events: Arc<EventBus>,
}

impl NodeRunner {
    async fn run(mut self) {
        info!(node = %self.node_id, "Node service started");

        // Catch up with whatever was published before this node came up
        let snapshot = self.directory_rx.borrow_and_update().clone();
        self.reconcile(&snapshot).await;

        loop {
            tokio::select! {
                changed = self.directory_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = self.directory_rx.borrow_and_update().clone();
                    self.reconcile(&snapshot).await;
                }
                Some(signal) = self.signals.recv() => match signal {
                    NodeSignal::CancelTask { id, reason } => {
                        self.cancel_local(id, &reason).await;
                    }
                },
                Some(completion) = self.completions_rx.recv() => {
                    self.on_completion(completion).await;
                }
                _ = self.shutdown.cancelled() => break,
            }
        }

        // The node is going away; stop local executions without reporting
        let handles: Vec<ExecutionHandle> = {
            let mut running = self.running.lock();
            running.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.cancel_local();
            handle.abort();
        }
        info!(node = %self.node_id, "Node service stopped");
    }

    async fn reconcile(&mut self, directory: &TaskDirectory) {
        // Versions are applied in order; re-observing an old or already
        // processed version must not produce any action.
        if directory.version() <= self.last_seen_version {
            debug!(
                node = %self.node_id,
                version = directory.version(),
                "Skipping already processed directory version"
            );
            return;
        }
        self.last_seen_version = directory.version();

        let running: Vec<TaskId> = self.running.lock().keys().copied().collect();
        let plan = diff(directory, &self.node_id, &running);

        if !plan.to_start.is_empty() || !plan.to_cancel.is_empty() {
            debug!(
                node = %self.node_id,
                version = directory.version(),
                starts = plan.to_start.len(),
                cancels = plan.to_cancel.len(),
                "Reconciling directory"
            );
        }

        for id in plan.to_cancel {
            self.cancel_local(id, "no longer assigned to this node").await;
        }

        for id in plan.to_start {
            if let Some(record) = directory.get(id) {
                self.start_task(record).await;
            }
        }
    }

    async fn start_task(&mut self, record: &TaskRecord) {
        match self.registry.lookup(&record.action_type) {
            Ok(holder) => {
                info!(
                    node = %self.node_id,
                    task = %record.id,
                    action = %record.action_type,
                    "Starting task"
                );
                let handle = ExecutionHandle::spawn(
                    record.id,
                    Arc::clone(&holder.handler),
                    record.payload.clone(),
                    self.completions_tx.clone(),
                );
                self.running.lock().insert(record.id, handle);
                self.link.report_started(record.id, self.node_id.clone());
                self.publish_event("task.started", EventSeverity::Info, json!({
                    "task": record.id,
                    "action": record.action_type,
                }))
                .await;
            }
            Err(err) => {
                // Likely registration skew between nodes; hand the task
                // back instead of silently dropping it.
                warn!(
                    node = %self.node_id,
                    task = %record.id,
                    action = %record.action_type,
                    "No handler for assigned task; reporting start failure"
                );
                self.link
                    .report_start_failed(record.id, self.node_id.clone(), err.to_string());
            }
        }
    }

    async fn cancel_local(&mut self, id: TaskId, reason: &str) {
        let handle = self.running.lock().remove(&id);
        if let Some(handle) = handle {
            info!(node = %self.node_id, task = %id, reason, "Cancelling local execution");
            handle.cancel_local();
            self.publish_event("task.cancelled", EventSeverity::Info, json!({
                "task": id,
                "reason": reason,
            }))
            .await;
        }
    }

    async fn on_completion(&mut self, completion: TaskCompletion) {
        let TaskCompletion { task_id, outcome } = completion;
        self.running.lock().remove(&task_id);

        match outcome {
            Ok(result) => {
                info!(node = %self.node_id, task = %task_id, "Task finished");
                self.publish_event("task.completed", EventSeverity::Info, json!({
                    "task": task_id,
                }))
                .await;
                self.link
                    .report_completed(task_id, self.node_id.clone(), result);
            }
            Err(err) => {
                let retryable = err.is_retryable();
                warn!(
                    node = %self.node_id,
                    task = %task_id,
                    retryable,
                    "Task execution failed: {}",
                    err
                );
                self.publish_event("task.failed", EventSeverity::Warning, json!({
                    "task": task_id,
                    "reason": err.to_string(),
                    "retryable": retryable,
                }))
                .await;
                self.link
                    .report_failed(task_id, self.node_id.clone(), err.to_string(), retryable);
            }
        }
    }

    async fn publish_event(&self, event_type: &str, severity: EventSeverity, payload: Value) {
        self.events
            .publish(
                ClusterEvent::new(event_type, EventCategory::Task)
                    .with_source(self.node_id.as_str().to_string())
                    .with_severity(severity)
                    .with_payload(payload),
            )
            .await;
    }
}

// ============================================================================
// Tests
// ============================================================================
