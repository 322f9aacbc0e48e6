//! End-to-end tests for the persistent-task coordination core
//!
//! `cargo test -p tether-task --test cluster_test`

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tether_foundation::{Error, NodeConfig, Result};
use tether_task::{
    ActionHandler, ActionRegistry, CancellationToken, NodeId, TaskCluster, TaskOutcome,
    TaskStatus,
};

/// Poll an async condition until it holds or the test times out
macro_rules! eventually {
    ($cond:expr) => {{
        let mut ok = false;
        for _ in 0..200 {
            if $cond {
                ok = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        assert!(ok, "condition not met in time: {}", stringify!($cond));
    }};
}

// ============================================================================
// Test handlers
// ============================================================================

/// Completes immediately, echoing its payload
struct Echo;

#[async_trait]
impl ActionHandler for Echo {
    async fn run(&self, payload: Value, _cancel: CancellationToken) -> Result<Value> {
        Ok(payload)
    }
}

/// Runs until cancelled, optionally recording that the cancellation was
/// observed
struct Blocker {
    observed_cancel: Arc<AtomicBool>,
}

impl Blocker {
    fn new() -> (Self, Arc<AtomicBool>) {
        let observed = Arc::new(AtomicBool::new(false));
        (
            Self {
                observed_cancel: Arc::clone(&observed),
            },
            observed,
        )
    }
}

#[async_trait]
impl ActionHandler for Blocker {
    async fn run(&self, _payload: Value, cancel: CancellationToken) -> Result<Value> {
        cancel.cancelled().await;
        self.observed_cancel.store(true, Ordering::SeqCst);
        Err(Error::Cancelled)
    }
}

/// Always fails with a retryable error
struct AlwaysRetryable;

#[async_trait]
impl ActionHandler for AlwaysRetryable {
    async fn run(&self, _payload: Value, _cancel: CancellationToken) -> Result<Value> {
        Err(Error::Timeout("simulated transient failure".into()))
    }
}

/// Always fails terminally
struct AlwaysFatal;

#[async_trait]
impl ActionHandler for AlwaysFatal {
    async fn run(&self, _payload: Value, _cancel: CancellationToken) -> Result<Value> {
        Err(Error::task_failed("unrecoverable input"))
    }
}

fn node(id: &str) -> NodeId {
    NodeId::new(id)
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_submit_unknown_action_fails() {
    let cluster = TaskCluster::new();
    let id = cluster
        .start_node(NodeConfig::new("node-1"), Arc::new(ActionRegistry::new()))
        .await
        .unwrap();
    cluster.elect(&id).await.unwrap();

    let client = cluster.client(&id).await.unwrap();
    let err = client.submit("nobody-has-this", json!(null)).await.unwrap_err();
    assert!(matches!(err, Error::UnknownAction(_)));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_submit_runs_and_completes() {
    let cluster = TaskCluster::new();
    for name in ["node-1", "node-2"] {
        let registry = Arc::new(ActionRegistry::new());
        registry.register("echo", "generic", Arc::new(Echo)).unwrap();
        cluster
            .start_node(NodeConfig::new(name), registry)
            .await
            .unwrap();
    }
    cluster.elect(&node("node-1")).await.unwrap();

    let client = cluster.client(&node("node-1")).await.unwrap();
    let (task_id, waiter) = client
        .submit_watched("echo", json!({"value": 42}))
        .await
        .unwrap();

    let outcome = waiter.wait().await.unwrap();
    assert_eq!(outcome, TaskOutcome::Completed(json!({"value": 42})));

    // Completed tasks are pruned, and no handle lingers anywhere
    eventually!(cluster.directory().is_empty());
    eventually!(cluster.running_tasks(&node("node-1")).await.unwrap().is_empty());
    eventually!(cluster.running_tasks(&node("node-2")).await.unwrap().is_empty());
    assert!(!cluster.directory().contains(task_id));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_assignment_prefers_lowest_node_id() {
    let cluster = TaskCluster::new();
    for name in ["node-2", "node-1", "node-3"] {
        let registry = Arc::new(ActionRegistry::new());
        let (blocker, _) = Blocker::new();
        registry.register("hold", "generic", Arc::new(blocker)).unwrap();
        cluster
            .start_node(NodeConfig::new(name), registry)
            .await
            .unwrap();
    }
    cluster.elect(&node("node-3")).await.unwrap();

    let client = cluster.client(&node("node-3")).await.unwrap();
    let task_id = client.submit("hold", json!(null)).await.unwrap();

    eventually!(cluster.running_tasks(&node("node-1")).await.unwrap().contains(&task_id));

    let record = cluster.directory().get(task_id).cloned().unwrap();
    assert_eq!(record.owner_node, Some(node("node-1")));
    assert_eq!(record.status, TaskStatus::Running);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_start_failure_reassigns_to_other_node() {
    let cluster = TaskCluster::new();

    // node-1 will advertise the action without actually holding a handler
    cluster
        .start_node(NodeConfig::new("node-1"), Arc::new(ActionRegistry::new()))
        .await
        .unwrap();

    let registry = Arc::new(ActionRegistry::new());
    let (blocker, _) = Blocker::new();
    registry.register("skewed", "generic", Arc::new(blocker)).unwrap();
    cluster
        .start_node(NodeConfig::new("node-2"), registry)
        .await
        .unwrap();

    cluster
        .advertise_action(&node("node-1"), "skewed", "generic")
        .await
        .unwrap();
    cluster.elect(&node("node-1")).await.unwrap();

    let client = cluster.client(&node("node-1")).await.unwrap();
    let task_id = client.submit("skewed", json!(null)).await.unwrap();

    // node-1 is picked first (lowest id), reports the start failure, and
    // the task lands on node-2
    eventually!(cluster.running_tasks(&node("node-2")).await.unwrap().contains(&task_id));

    let record = cluster.directory().get(task_id).cloned().unwrap();
    assert_eq!(record.owner_node, Some(node("node-2")));
    assert!(record.last_failure.is_some());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_cancel_unassigned_task_prunes_without_signal() {
    let cluster = TaskCluster::new();

    // The action's pool has zero capacity, so the task can never be
    // assigned and stays pending
    let registry = Arc::new(ActionRegistry::new());
    registry.register("parked", "ml", Arc::new(Echo)).unwrap();
    let config = NodeConfig::new("node-1").with_pool("ml", 0);
    cluster.start_node(config, registry).await.unwrap();
    cluster.elect(&node("node-1")).await.unwrap();

    let client = cluster.client(&node("node-1")).await.unwrap();
    let task_id = client.submit("parked", json!(null)).await.unwrap();

    let record = cluster.directory().get(task_id).cloned().unwrap();
    assert_eq!(record.status, TaskStatus::Created);
    assert_eq!(record.owner_node, None);
    assert!(cluster.running_tasks(&node("node-1")).await.unwrap().is_empty());

    client.cancel(task_id, "no longer needed").await.unwrap();

    // Pruned as soon as the cancel returns; nothing ever ran
    assert!(cluster.directory().is_empty());
    assert!(cluster.running_tasks(&node("node-1")).await.unwrap().is_empty());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_node_loss_triggers_reassignment() {
    let cluster = TaskCluster::new();
    for name in ["node-1", "node-2"] {
        let registry = Arc::new(ActionRegistry::new());
        let (blocker, _) = Blocker::new();
        registry.register("hold", "generic", Arc::new(blocker)).unwrap();
        cluster
            .start_node(NodeConfig::new(name), registry)
            .await
            .unwrap();
    }
    // Leader on node-2 so it survives the loss of node-1
    cluster.elect(&node("node-2")).await.unwrap();

    let client = cluster.client(&node("node-2")).await.unwrap();
    let task_id = client.submit("hold", json!(null)).await.unwrap();

    eventually!(cluster.running_tasks(&node("node-1")).await.unwrap().contains(&task_id));

    cluster.stop_node(&node("node-1")).await.unwrap();

    // The task passes back through unassigned and lands on node-2
    eventually!(cluster.running_tasks(&node("node-2")).await.unwrap().contains(&task_id));

    let record = cluster.directory().get(task_id).cloned().unwrap();
    assert_eq!(record.owner_node, Some(node("node-2")));
    assert_eq!(record.status, TaskStatus::Running);
    assert!(record.last_failure.is_some());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_cancel_running_task_is_silent_on_the_node() {
    let cluster = TaskCluster::new();
    let registry = Arc::new(ActionRegistry::new());
    let (blocker, observed_cancel) = Blocker::new();
    registry.register("hold", "generic", Arc::new(blocker)).unwrap();
    cluster
        .start_node(NodeConfig::new("node-1"), registry)
        .await
        .unwrap();
    cluster.elect(&node("node-1")).await.unwrap();

    let client = cluster.client(&node("node-1")).await.unwrap();
    let (task_id, waiter) = client.submit_watched("hold", json!(null)).await.unwrap();

    eventually!(cluster.running_tasks(&node("node-1")).await.unwrap().contains(&task_id));

    client.cancel(task_id, "user aborted").await.unwrap();

    // Removal is visible as soon as the cancel is acknowledged
    assert!(!cluster.directory().contains(task_id));
    assert_eq!(waiter.wait().await.unwrap(), TaskOutcome::Removed);

    // The handler sees the token; the node stays silent, so nothing
    // reappears in the directory
    eventually!(observed_cancel.load(Ordering::SeqCst));
    eventually!(cluster.running_tasks(&node("node-1")).await.unwrap().is_empty());
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(cluster.directory().is_empty());

    // The node recorded both lifecycle events
    let history = cluster.events().history(None).await;
    assert!(history.iter().any(|e| e.event_type == "task.started"));
    assert!(history.iter().any(|e| e.event_type == "task.cancelled"));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_retryable_failure_moves_task_to_another_node() {
    let cluster = TaskCluster::new();

    // node-1's handler always fails retryably; node-2's succeeds
    let registry = Arc::new(ActionRegistry::new());
    registry
        .register("fragile", "generic", Arc::new(AlwaysRetryable))
        .unwrap();
    cluster
        .start_node(NodeConfig::new("node-1"), registry)
        .await
        .unwrap();

    let registry = Arc::new(ActionRegistry::new());
    registry.register("fragile", "generic", Arc::new(Echo)).unwrap();
    cluster
        .start_node(NodeConfig::new("node-2"), registry)
        .await
        .unwrap();

    cluster.elect(&node("node-1")).await.unwrap();

    let client = cluster.client(&node("node-1")).await.unwrap();
    let (_, waiter) = client
        .submit_watched("fragile", json!({"ok": true}))
        .await
        .unwrap();

    // First attempt on node-1 fails and is retried on node-2
    let outcome = waiter.wait().await.unwrap();
    assert_eq!(outcome, TaskOutcome::Completed(json!({"ok": true})));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_terminal_failure_resolves_waiters() {
    let cluster = TaskCluster::new();
    let registry = Arc::new(ActionRegistry::new());
    registry
        .register("doomed", "generic", Arc::new(AlwaysFatal))
        .unwrap();
    cluster
        .start_node(NodeConfig::new("node-1"), registry)
        .await
        .unwrap();
    cluster.elect(&node("node-1")).await.unwrap();

    let client = cluster.client(&node("node-1")).await.unwrap();
    let (task_id, waiter) = client.submit_watched("doomed", json!(null)).await.unwrap();

    match waiter.wait().await.unwrap() {
        TaskOutcome::Failed(reason) => assert!(reason.contains("unrecoverable input")),
        other => panic!("expected terminal failure, got {other:?}"),
    }

    // Terminal tasks are pruned, not kept around
    eventually!(!cluster.directory().contains(task_id));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_directory_versions_are_monotonic() {
    let cluster = TaskCluster::new();
    let registry = Arc::new(ActionRegistry::new());
    registry.register("echo", "generic", Arc::new(Echo)).unwrap();
    cluster
        .start_node(NodeConfig::new("node-1"), registry)
        .await
        .unwrap();
    cluster.elect(&node("node-1")).await.unwrap();

    let mut rx = cluster.subscribe_directory();
    let versions = Arc::new(parking_lot::Mutex::new(vec![rx.borrow().version()]));
    let watcher = {
        let versions = Arc::clone(&versions);
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                versions.lock().push(rx.borrow_and_update().version());
            }
        })
    };

    let client = cluster.client(&node("node-1")).await.unwrap();
    for i in 0..5 {
        let (_, waiter) = client
            .submit_watched("echo", json!({ "round": i }))
            .await
            .unwrap();
        waiter.wait().await.unwrap();
    }

    eventually!(cluster.directory().is_empty());
    cluster.shutdown().await;
    watcher.abort();
    let _ = watcher.await;

    let versions = versions.lock();
    assert!(versions.len() > 1);
    assert!(
        versions.windows(2).all(|w| w[0] < w[1]),
        "observed versions must strictly increase: {versions:?}"
    );
}

#[tokio::test]
async fn test_leadership_change_keeps_tasks_running() {
    let cluster = TaskCluster::new();
    for name in ["node-1", "node-2"] {
        let registry = Arc::new(ActionRegistry::new());
        let (blocker, _) = Blocker::new();
        registry.register("hold", "generic", Arc::new(blocker)).unwrap();
        cluster
            .start_node(NodeConfig::new(name), registry)
            .await
            .unwrap();
    }
    cluster.elect(&node("node-1")).await.unwrap();

    let client = cluster.client(&node("node-1")).await.unwrap();
    let (task_id, waiter) = client.submit_watched("hold", json!(null)).await.unwrap();

    eventually!(cluster.running_tasks(&node("node-1")).await.unwrap().contains(&task_id));
    let version_before = cluster.directory().version();

    cluster.elect(&node("node-2")).await.unwrap();

    // In-flight waiter observes the teardown rather than hanging forever
    assert!(waiter.wait().await.is_err());

    // The directory survives the handover and the execution never moved
    assert!(cluster.directory().version() >= version_before);
    let record = cluster.directory().get(task_id).cloned().unwrap();
    assert_eq!(record.owner_node, Some(node("node-1")));
    assert!(cluster.running_tasks(&node("node-1")).await.unwrap().contains(&task_id));

    // The old leader's client now fails fast with a redirect hint
    let err = cluster
        .client(&node("node-1"))
        .await
        .unwrap()
        .submit("hold", json!(null))
        .await
        .unwrap_err();
    match err {
        Error::NotLeader { leader } => assert_eq!(leader.as_deref(), Some("node-2")),
        other => panic!("expected NotLeader, got {other}"),
    }

    // The new leader serves cancellation for the surviving task
    let client = cluster.client(&node("node-2")).await.unwrap();
    client.cancel(task_id, "cleanup").await.unwrap();
    eventually!(cluster.running_tasks(&node("node-1")).await.unwrap().is_empty());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_await_completion_after_prune_is_unknown() {
    let cluster = TaskCluster::new();
    let registry = Arc::new(ActionRegistry::new());
    registry.register("echo", "generic", Arc::new(Echo)).unwrap();
    cluster
        .start_node(NodeConfig::new("node-1"), registry)
        .await
        .unwrap();
    cluster.elect(&node("node-1")).await.unwrap();

    let client = cluster.client(&node("node-1")).await.unwrap();
    let (task_id, waiter) = client.submit_watched("echo", json!(null)).await.unwrap();
    waiter.wait().await.unwrap();

    eventually!(cluster.directory().is_empty());

    // The record is gone after acknowledgment; late waiters are told so
    let err = client.await_completion(task_id).await.unwrap_err();
    assert!(matches!(err, Error::UnknownTask(_)));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_pending_task_assigned_when_capacity_appears() {
    let cluster = TaskCluster::new();

    // Only node-1 exists and it has no capacity in the action's pool
    let registry = Arc::new(ActionRegistry::new());
    registry.register("queued", "ml", Arc::new(Echo)).unwrap();
    cluster
        .start_node(NodeConfig::new("node-1").with_pool("ml", 0), registry)
        .await
        .unwrap();
    cluster.elect(&node("node-1")).await.unwrap();

    let client = cluster.client(&node("node-1")).await.unwrap();
    let (task_id, waiter) = client.submit_watched("queued", json!(null)).await.unwrap();

    let record = cluster.directory().get(task_id).cloned().unwrap();
    assert_eq!(record.status, TaskStatus::Created);

    // A node with spare capacity joins; the pending task is picked up
    let registry = Arc::new(ActionRegistry::new());
    registry.register("queued", "ml", Arc::new(Echo)).unwrap();
    cluster
        .start_node(NodeConfig::new("node-2").with_pool("ml", 1), registry)
        .await
        .unwrap();

    assert!(matches!(
        waiter.wait().await.unwrap(),
        TaskOutcome::Completed(_)
    ));

    cluster.shutdown().await;
}
