//! Directory Coordinator - the leader-only writer of the Task Directory
//!
//! One coordinator actor exists per leadership term, on the leader node.
//! All directory mutations flow through its command queue and are applied
//! strictly one at a time, so task-state transitions have a total order
//! cluster-wide. Losing leadership tears the actor down; whatever it had
//! not published dies with it.

use crate::assign::{AssignmentPolicy, NodeCandidate};
use crate::directory::{DirectoryBuilder, DirectoryPublisher, TaskId, TaskStatus};
use crate::membership::{ClusterMembership, MembershipEvent, NodeId};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tether_foundation::{ClusterEvent, Error, EventBus, EventCategory, EventSeverity, Result};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

// ============================================================================
// TaskOutcome
// ============================================================================

/// Terminal result of a persistent task, delivered to completion waiters
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Finished successfully with the handler's result
    Completed(Value),
    /// Terminal failure
    Failed(String),
    /// Explicitly cancelled by a client
    Removed,
}

// ============================================================================
// NodeSignal
// ============================================================================

/// Out-of-band signal from the coordinator to one node service
#[derive(Debug)]
pub enum NodeSignal {
    /// Stop the local execution of a task that has been removed from the
    /// directory
    CancelTask { id: TaskId, reason: String },
}

// ============================================================================
// Commands
// ============================================================================

enum Command {
    StartTask {
        action_type: String,
        payload: Value,
        watch: Option<oneshot::Sender<TaskOutcome>>,
        reply: oneshot::Sender<Result<TaskId>>,
    },
    CancelTask {
        id: TaskId,
        reason: String,
        reply: oneshot::Sender<Result<()>>,
    },
    AwaitCompletion {
        id: TaskId,
        reply: oneshot::Sender<Result<oneshot::Receiver<TaskOutcome>>>,
    },
    ReportStarted {
        id: TaskId,
        node: NodeId,
    },
    ReportStartFailed {
        id: TaskId,
        node: NodeId,
        reason: String,
    },
    ReportCompleted {
        id: TaskId,
        node: NodeId,
        result: Value,
    },
    ReportFailed {
        id: TaskId,
        node: NodeId,
        reason: String,
        retryable: bool,
    },
    AttachNode {
        node: NodeId,
        signals: mpsc::UnboundedSender<NodeSignal>,
    },
    DetachNode {
        node: NodeId,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// ============================================================================
// CoordinatorHandle
// ============================================================================

/// Client side of a coordinator's command queue.
///
/// Sends fail once the coordinator has stepped down; callers observe that
/// as `NotLeader`.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl CoordinatorHandle {
    pub async fn start_task(
        &self,
        action_type: impl Into<String>,
        payload: Value,
        watch: Option<oneshot::Sender<TaskOutcome>>,
    ) -> Result<TaskId> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::StartTask {
            action_type: action_type.into(),
            payload,
            watch,
            reply,
        })
        .map_err(|_| Self::gone())?;
        rx.await.map_err(|_| Self::gone())?
    }

    pub async fn cancel_task(&self, id: TaskId, reason: impl Into<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CancelTask {
            id,
            reason: reason.into(),
            reply,
        })
        .map_err(|_| Self::gone())?;
        rx.await.map_err(|_| Self::gone())?
    }

    /// Register a completion waiter for an existing task
    pub async fn await_completion(&self, id: TaskId) -> Result<oneshot::Receiver<TaskOutcome>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::AwaitCompletion { id, reply })
            .map_err(|_| Self::gone())?;
        rx.await.map_err(|_| Self::gone())?
    }

    /// Route out-of-band signals for a node through the given channel
    pub fn attach_node(&self, node: NodeId, signals: mpsc::UnboundedSender<NodeSignal>) {
        let _ = self.send(Command::AttachNode { node, signals });
    }

    pub fn detach_node(&self, node: NodeId) {
        let _ = self.send(Command::DetachNode { node });
    }

    /// Stop the coordinator and wait until it has drained
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    fn send(&self, cmd: Command) -> std::result::Result<(), Command> {
        self.tx.send(cmd).map_err(|e| e.0)
    }

    fn gone() -> Error {
        Error::NotLeader { leader: None }
    }
}

// ============================================================================
// CoordinatorLink
// ============================================================================

/// A node's stable route to "the current leader's coordinator".
///
/// Coordinators come and go with leadership; the link outlives them.
/// Reports sent while no coordinator is reachable are held back and
/// drained to the next one, so completion and failure notifications
/// survive an election. Stale reports are tolerated by the receiving
/// coordinator.
pub struct CoordinatorLink {
    inner: Mutex<LinkInner>,
}

struct LinkInner {
    handle: Option<CoordinatorHandle>,
    backlog: Vec<Command>,
}

impl CoordinatorLink {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LinkInner {
                handle: None,
                backlog: Vec::new(),
            }),
        }
    }

    /// Point the link at a freshly spawned coordinator and drain any
    /// held-back reports to it.
    pub fn set_handle(&self, handle: CoordinatorHandle) {
        let mut inner = self.inner.lock();
        for cmd in inner.backlog.drain(..) {
            let _ = handle.send(cmd);
        }
        inner.handle = Some(handle);
    }

    pub fn clear_handle(&self) {
        self.inner.lock().handle = None;
    }

    /// Current coordinator handle, if a leader is serving
    pub fn handle(&self) -> Option<CoordinatorHandle> {
        self.inner.lock().handle.clone()
    }

    pub fn report_started(&self, id: TaskId, node: NodeId) {
        self.dispatch(Command::ReportStarted { id, node });
    }

    pub fn report_start_failed(&self, id: TaskId, node: NodeId, reason: impl Into<String>) {
        self.dispatch(Command::ReportStartFailed {
            id,
            node,
            reason: reason.into(),
        });
    }

    pub fn report_completed(&self, id: TaskId, node: NodeId, result: Value) {
        self.dispatch(Command::ReportCompleted { id, node, result });
    }

    pub fn report_failed(
        &self,
        id: TaskId,
        node: NodeId,
        reason: impl Into<String>,
        retryable: bool,
    ) {
        self.dispatch(Command::ReportFailed {
            id,
            node,
            reason: reason.into(),
            retryable,
        });
    }

    fn dispatch(&self, cmd: Command) {
        let mut inner = self.inner.lock();
        match inner.handle.clone() {
            Some(handle) => {
                if let Err(cmd) = handle.send(cmd) {
                    // Coordinator stepped down; hold the report for the
                    // next leader.
                    inner.handle = None;
                    inner.backlog.push(cmd);
                }
            }
            None => inner.backlog.push(cmd),
        }
    }
}

impl Default for CoordinatorLink {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// DirectoryCoordinator
// ============================================================================

/// The single logical writer of the Task Directory, active only on the
/// elected leader.
pub struct DirectoryCoordinator {
    node_id: NodeId,
    membership: Arc<ClusterMembership>,
    policy: Arc<dyn AssignmentPolicy>,
    publisher: DirectoryPublisher,
    events: Arc<EventBus>,
    commands: mpsc::UnboundedReceiver<Command>,
    membership_events: broadcast::Receiver<MembershipEvent>,
    waiters: HashMap<TaskId, Vec<oneshot::Sender<TaskOutcome>>>,
    links: HashMap<NodeId, mpsc::UnboundedSender<NodeSignal>>,
}

impl DirectoryCoordinator {
    /// Spawn the coordinator actor for this leadership term. It resumes
    /// from the publisher's last published snapshot.
    pub fn spawn(
        node_id: NodeId,
        membership: Arc<ClusterMembership>,
        policy: Arc<dyn AssignmentPolicy>,
        publisher: DirectoryPublisher,
        events: Arc<EventBus>,
    ) -> CoordinatorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let membership_events = membership.subscribe();

        let coordinator = Self {
            node_id,
            membership,
            policy,
            publisher,
            events,
            commands: rx,
            membership_events,
            waiters: HashMap::new(),
            links: HashMap::new(),
        };
        tokio::spawn(coordinator.run());

        CoordinatorHandle { tx }
    }

    async fn run(mut self) {
        info!(
            node = %self.node_id,
            version = self.publisher.latest().version(),
            policy = self.policy.name(),
            "Directory coordinator taking over"
        );

        // Membership may have changed while no leader was serving
        self.recover().await;

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => {
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.apply(cmd).await,
                    None => break,
                },
                event = self.membership_events.recv() => match event {
                    Ok(MembershipEvent::NodeLeft(node)) => self.on_node_left(node).await,
                    Ok(MembershipEvent::NodeJoined(_)) => {
                        // A new node may unblock pending assignments
                        let builder = self.publisher.latest().to_builder();
                        self.finish_mutation(builder).await;
                    }
                    Ok(MembershipEvent::LeaderChanged(leader)) => {
                        if leader.as_ref() != Some(&self.node_id) {
                            info!(node = %self.node_id, new_leader = ?leader, "Lost leadership");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Membership event stream lagged; resyncing");
                        self.recover().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        info!(node = %self.node_id, "Directory coordinator stepping down");
        // Dropping the waiters closes their channels; blocked clients
        // observe the leadership change instead of hanging.
    }

    async fn apply(&mut self, cmd: Command) {
        match cmd {
            Command::StartTask {
                action_type,
                payload,
                watch,
                reply,
            } => {
                // The action must be registered somewhere in the cluster;
                // its pool is taken from that advertisement.
                let Some(pool) = self.membership.pool_for_action(&action_type).await else {
                    let _ = reply.send(Err(Error::UnknownAction(action_type)));
                    return;
                };

                let mut builder = self.publisher.latest().to_builder();
                let id = builder.create_task(&action_type, payload, &pool);
                if let Some(watcher) = watch {
                    self.waiters.entry(id).or_default().push(watcher);
                }
                info!(task = %id, action = %action_type, pool = %pool, "Task created");
                self.finish_mutation(builder).await;
                let _ = reply.send(Ok(id));
            }

            Command::CancelTask { id, reason, reply } => {
                let mut builder = self.publisher.latest().to_builder();
                match builder.remove(id) {
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                    Ok(record) => {
                        info!(task = %id, reason = %reason, "Task removed on client request");
                        if let Some(owner) = &record.owner_node {
                            self.signal(
                                owner,
                                NodeSignal::CancelTask {
                                    id,
                                    reason: reason.clone(),
                                },
                            );
                        }
                        self.resolve_waiters(id, TaskOutcome::Removed);
                        self.finish_mutation(builder).await;
                        let _ = reply.send(Ok(()));
                    }
                }
            }

            Command::AwaitCompletion { id, reply } => {
                if self.publisher.latest().contains(id) {
                    let (tx, rx) = oneshot::channel();
                    self.waiters.entry(id).or_default().push(tx);
                    let _ = reply.send(Ok(rx));
                } else {
                    let _ = reply.send(Err(Error::UnknownTask(id.0)));
                }
            }

            Command::ReportStarted { id, node } => {
                match self.publisher.latest().get(id) {
                    Some(record) if record.is_owned_by(&node) => {
                        debug!(task = %id, node = %node, "Task confirmed started");
                    }
                    _ => debug!(task = %id, node = %node, "Ignoring stale start report"),
                }
            }

            Command::ReportStartFailed { id, node, reason } => {
                let mut builder = self.publisher.latest().to_builder();
                if Self::owned_and_running(&builder, id, &node) {
                    warn!(task = %id, node = %node, reason = %reason, "Task failed to start; unassigning");
                    let _ = builder.unassign(id, reason);
                    self.finish_mutation(builder).await;
                } else {
                    debug!(task = %id, node = %node, "Ignoring stale start-failure report");
                }
            }

            Command::ReportCompleted { id, node, result } => {
                let mut builder = self.publisher.latest().to_builder();
                if Self::owned_and_running(&builder, id, &node) {
                    let _ = builder.finish(id);
                    info!(task = %id, node = %node, "Task completed");
                    self.resolve_waiters(id, TaskOutcome::Completed(result));
                    self.finish_mutation(builder).await;
                } else {
                    debug!(task = %id, node = %node, "Ignoring stale completion report");
                }
            }

            Command::ReportFailed {
                id,
                node,
                reason,
                retryable,
            } => {
                let mut builder = self.publisher.latest().to_builder();
                if Self::owned_and_running(&builder, id, &node) {
                    if retryable {
                        warn!(task = %id, node = %node, reason = %reason, "Task failed; will reassign");
                        let _ = builder.unassign(id, reason);
                    } else {
                        warn!(task = %id, node = %node, reason = %reason, "Task failed terminally");
                        let _ = builder.fail(id, reason.clone());
                        self.resolve_waiters(id, TaskOutcome::Failed(reason));
                    }
                    self.finish_mutation(builder).await;
                } else if !retryable && Self::last_owned_pending(&builder, id, &node) {
                    // The unassignment (e.g. a node-loss race) got here
                    // first, but the execution had already failed for good.
                    warn!(task = %id, node = %node, reason = %reason, "Pending task failed terminally");
                    let _ = builder.fail(id, reason.clone());
                    self.resolve_waiters(id, TaskOutcome::Failed(reason));
                    self.finish_mutation(builder).await;
                } else {
                    debug!(task = %id, node = %node, "Ignoring stale failure report");
                }
            }

            Command::AttachNode { node, signals } => {
                debug!(node = %node, "Node signal channel attached");
                self.links.insert(node, signals);
            }

            Command::DetachNode { node } => {
                self.links.remove(&node);
            }

            // Handled in the select loop
            Command::Shutdown { .. } => unreachable!("shutdown handled by run loop"),
        }
    }

    /// Unassign everything the departed node owned; reassignment happens
    /// in the same mutation batch.
    async fn on_node_left(&mut self, node: NodeId) {
        self.links.remove(&node);

        let mut builder = self.publisher.latest().to_builder();
        let owned = builder.owned_ids(&node);
        if !owned.is_empty() {
            warn!(node = %node, count = owned.len(), "Node left; unassigning its tasks");
            for id in owned {
                let _ = builder.unassign(id, format!("node {} left the cluster", node));
            }
        }
        self.finish_mutation(builder).await;
    }

    /// Startup / resync pass: drop assignments to nodes that are gone,
    /// then run a normal assignment pass.
    async fn recover(&mut self) {
        let alive: Vec<NodeId> = self
            .membership
            .nodes()
            .await
            .into_iter()
            .map(|n| n.id)
            .collect();

        let mut builder = self.publisher.latest().to_builder();
        let orphaned: Vec<TaskId> = builder
            .tasks()
            .filter(|r| {
                r.status == TaskStatus::Running
                    && r.owner_node.as_ref().is_some_and(|owner| !alive.contains(owner))
            })
            .map(|r| r.id)
            .collect();

        for id in orphaned {
            warn!(task = %id, "Owner no longer in cluster; unassigning");
            let _ = builder.unassign(id, "owner node no longer in cluster");
        }
        self.finish_mutation(builder).await;
    }

    /// Assignment pass over pending tasks, then publish when anything
    /// changed.
    async fn finish_mutation(&mut self, mut builder: DirectoryBuilder) {
        let nodes = self.membership.nodes().await;

        for id in builder.pending_ids() {
            let Some(record) = builder.get(id) else { continue };
            let action = record.action_type.clone();
            let pool = record.executor_pool.clone();
            let last_owner = record.last_owner.clone();

            let candidates: Vec<NodeCandidate> = nodes
                .iter()
                .map(|info| NodeCandidate {
                    info: info.clone(),
                    owned_in_pool: builder.owned_in_pool(&info.id, &pool),
                })
                .collect();

            // Prefer a different node than the one that just gave the
            // task up; fall back when it is the only candidate.
            let preferred: Vec<NodeCandidate> = candidates
                .iter()
                .filter(|c| Some(&c.info.id) != last_owner.as_ref())
                .cloned()
                .collect();

            let choice = self
                .policy
                .select(&action, &pool, &preferred)
                .or_else(|| self.policy.select(&action, &pool, &candidates));

            match choice {
                Some(node) => {
                    info!(task = %id, node = %node, "Task assigned");
                    let _ = builder.assign(id, node);
                }
                None => {
                    let err = Error::NoEligibleNode { pool: pool.clone() };
                    warn!(task = %id, "{}; task stays pending until a node is eligible", err);
                }
            }
        }

        if !builder.changed() {
            return;
        }

        let directory = builder.build();
        debug_assert!(directory.validate().is_ok());
        let published = self.publisher.publish(directory);
        debug!(version = published.version(), "Directory published");

        self.events
            .publish(
                ClusterEvent::new("directory.published", EventCategory::Directory)
                    .with_source(self.node_id.as_str().to_string())
                    .with_severity(EventSeverity::Debug)
                    .with_payload(json!({ "version": published.version() })),
            )
            .await;
    }

    fn owned_and_running(builder: &DirectoryBuilder, id: TaskId, node: &NodeId) -> bool {
        builder
            .get(id)
            .map(|r| r.status == TaskStatus::Running && r.is_owned_by(node))
            .unwrap_or(false)
    }

    fn last_owned_pending(builder: &DirectoryBuilder, id: TaskId, node: &NodeId) -> bool {
        builder
            .get(id)
            .map(|r| r.status == TaskStatus::Created && r.last_owner.as_ref() == Some(node))
            .unwrap_or(false)
    }

    fn resolve_waiters(&mut self, id: TaskId, outcome: TaskOutcome) {
        if let Some(waiters) = self.waiters.remove(&id) {
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    fn signal(&self, node: &NodeId, signal: NodeSignal) {
        match self.links.get(node) {
            Some(link) => {
                let _ = link.send(signal);
            }
            None => debug!(node = %node, "No signal channel for node"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
