//! Demonstration cluster
//!
//! Starts an in-process cluster, submits a handful of long-running tasks,
//! optionally kills a node halfway through, and prints the lifecycle
//! events the cluster emits while the survivors pick up the slack.

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_foundation::{
    ClusterConfig, Error, EventCategory, EventFilter, EventSeverity, NodeConfig, Result,
};
use tether_task::{
    ActionHandler, ActionRegistry, CancellationToken, CompletionWaiter, NodeId, TaskCluster,
    TaskOutcome,
};
use tracing::info;

pub struct DemoOptions {
    pub config: Option<PathBuf>,
    pub nodes: usize,
    pub tasks: usize,
    pub simulate_failure: bool,
}

// ============================================================================
// Demo actions
// ============================================================================

/// Counts down in small ticks so cancellation and reassignment are
/// observable mid-flight
struct CountdownAction;

#[async_trait]
impl ActionHandler for CountdownAction {
    async fn run(&self, payload: Value, cancel: CancellationToken) -> Result<Value> {
        let ticks = payload.get("ticks").and_then(Value::as_u64).unwrap_or(10);

        for remaining in (0..ticks).rev() {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
            if remaining == 0 {
                break;
            }
        }

        Ok(json!({ "ticks": ticks }))
    }
}

/// Fails with a retryable error on its first attempts, then succeeds.
/// The attempt counter is shared across nodes, so a reassigned run picks
/// up where the failed one left off.
struct FlakyAction {
    attempts: Arc<AtomicU32>,
    fail_first: u32,
}

#[async_trait]
impl ActionHandler for FlakyAction {
    async fn run(&self, _payload: Value, _cancel: CancellationToken) -> Result<Value> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_first {
            return Err(Error::Timeout(format!("flaky attempt {} failed", attempt)));
        }
        Ok(json!({ "attempts": attempt }))
    }
}

// ============================================================================
// Runner
// ============================================================================

pub async fn run(options: DemoOptions) -> anyhow::Result<()> {
    let topology = match &options.config {
        Some(path) => ClusterConfig::load(path)
            .with_context(|| format!("loading cluster config {}", path.display()))?,
        None => ClusterConfig {
            nodes: (1..=options.nodes.max(1))
                .map(|i| NodeConfig::new(format!("node-{}", i)))
                .collect(),
        },
    };

    let cluster = TaskCluster::new();
    let flaky_attempts = Arc::new(AtomicU32::new(0));

    for node_config in &topology.nodes {
        let registry = Arc::new(ActionRegistry::new());
        registry
            .register("countdown", "generic", Arc::new(CountdownAction))
            .ok();
        registry
            .register(
                "flaky",
                "generic",
                Arc::new(FlakyAction {
                    attempts: Arc::clone(&flaky_attempts),
                    fail_first: 2,
                }),
            )
            .ok();
        cluster.start_node(node_config.clone(), registry).await?;
    }

    let leader = NodeId::new(topology.nodes[0].node_id.clone());
    cluster.elect(&leader).await?;

    // Print interesting cluster events as they happen
    let printer = spawn_event_printer(&cluster);

    let client = cluster.client(&leader).await?;
    let mut waiters: Vec<(String, CompletionWaiter)> = Vec::new();

    for i in 0..options.tasks {
        let (task_id, waiter) = client
            .submit_watched("countdown", json!({ "ticks": 8 + i as u64 }))
            .await?;
        waiters.push((task_id.to_string(), waiter));
    }
    let (flaky_id, flaky_waiter) = client.submit_watched("flaky", json!(null)).await?;
    waiters.push((flaky_id.to_string(), flaky_waiter));

    info!(
        tasks = waiters.len(),
        nodes = topology.nodes.len(),
        "Demo cluster running"
    );

    if options.simulate_failure && topology.nodes.len() > 1 {
        tokio::time::sleep(Duration::from_millis(800)).await;
        // Kill a non-leader node; the leader reassigns whatever it ran
        let victim = NodeId::new(topology.nodes[1].node_id.clone());
        println!(">>> simulating failure of {}", victim);
        cluster.stop_node(&victim).await?;
    }

    for (task, waiter) in waiters {
        match waiter.wait().await {
            Ok(TaskOutcome::Completed(result)) => {
                println!("<<< {} completed: {}", task, result)
            }
            Ok(TaskOutcome::Failed(reason)) => println!("<<< {} failed: {}", task, reason),
            Ok(TaskOutcome::Removed) => println!("<<< {} removed", task),
            Err(err) => println!("<<< {} lost: {}", task, err),
        }
    }

    cluster.shutdown().await;
    printer.abort();
    Ok(())
}

fn spawn_event_printer(cluster: &TaskCluster) -> tokio::task::JoinHandle<()> {
    let mut events = cluster.events().receiver();
    let filter = EventFilter::new()
        .with_categories(vec![EventCategory::Task, EventCategory::Membership])
        .with_min_severity(EventSeverity::Info);

    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if filter.matches(&event) {
                println!(
                    "  [{}] {} {} {}",
                    event.timestamp.format("%H:%M:%S%.3f"),
                    event.source,
                    event.event_type,
                    event.payload
                );
            }
        }
    })
}
