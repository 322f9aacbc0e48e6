//! Task Directory - the authoritative record of every persistent task
//!
//! The directory is an immutable value: mutations go through a
//! [`DirectoryBuilder`] seeded from the previous snapshot and produce a new
//! snapshot with a higher version. Published snapshots are shared as
//! `Arc<TaskDirectory>` through a watch channel, so readers always see a
//! complete directory and never observe in-place mutation.

use crate::membership::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tether_foundation::{Error, Result};
use tokio::sync::watch;
use tracing::warn;

// ============================================================================
// TaskId
// ============================================================================

/// Unique identifier for a persistent task.
///
/// Assigned by the leader at creation time, monotonically increasing,
/// never reused.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

// ============================================================================
// TaskStatus
// ============================================================================

/// Status of a persistent task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for assignment; `owner_node` is empty
    Created,
    /// Assigned to a node and expected to be executing there
    Running,
    /// Finished successfully (terminal)
    Completed,
    /// Failed with a non-retryable error (terminal)
    Failed,
    /// Explicitly cancelled by a client (terminal)
    Removed,
}

impl TaskStatus {
    /// Terminal states cannot transition further
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Removed)
    }

    /// States in which a node owning the task should be executing it
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Created | Self::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Removed => "removed",
        };
        write!(f, "{}", name)
    }
}

// ============================================================================
// TaskRecord
// ============================================================================

/// One entry in the Task Directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,

    /// Which registered handler must run this task
    pub action_type: String,

    /// Opaque parameters handed to the handler
    pub payload: Value,

    /// Executor pool the action runs in, resolved at creation time so
    /// reassignment does not depend on the submitting node's registry
    pub executor_pool: String,

    /// Node currently responsible for execution; `None` means pending
    /// assignment
    pub owner_node: Option<NodeId>,

    /// Owner before the most recent unassignment. Reassignment avoids
    /// this node while other eligible nodes exist.
    pub last_owner: Option<NodeId>,

    pub status: TaskStatus,

    /// Description of the last retried execution failure, if any
    pub last_failure: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn is_owned_by(&self, node: &NodeId) -> bool {
        self.owner_node.as_ref() == Some(node)
    }
}

// ============================================================================
// TaskDirectory
// ============================================================================

/// Versioned, ordered map of all persistent tasks.
///
/// Invariants:
/// - at most one node owns a given non-terminal task at a given version
/// - reassignment always passes through `owner_node = None`
/// - `version` strictly increases, one increment per applied transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDirectory {
    version: u64,
    next_task_id: u64,
    tasks: BTreeMap<TaskId, TaskRecord>,
}

impl TaskDirectory {
    /// Empty directory at version 0
    pub fn empty() -> Self {
        Self {
            version: 0,
            next_task_id: 1,
            tasks: BTreeMap::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, id: TaskId) -> Option<&TaskRecord> {
        self.tasks.get(&id)
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    /// All records in task-id order
    pub fn tasks(&self) -> impl Iterator<Item = &TaskRecord> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks currently owned by the given node
    pub fn owned_by<'a>(&'a self, node: &'a NodeId) -> impl Iterator<Item = &'a TaskRecord> {
        self.tasks.values().filter(move |r| r.is_owned_by(node))
    }

    /// Number of tasks the node owns in the given executor pool
    pub fn owned_in_pool(&self, node: &NodeId, pool: &str) -> usize {
        self.owned_by(node)
            .filter(|r| r.executor_pool == pool)
            .count()
    }

    /// Tasks awaiting assignment
    pub fn pending(&self) -> impl Iterator<Item = &TaskRecord> {
        self.tasks
            .values()
            .filter(|r| r.status == TaskStatus::Created && r.owner_node.is_none())
    }

    /// Start a builder seeded from this snapshot
    pub fn to_builder(&self) -> DirectoryBuilder {
        DirectoryBuilder {
            base_version: self.version,
            version: self.version,
            next_task_id: self.next_task_id,
            tasks: self.tasks.clone(),
        }
    }

    /// Check the structural invariants. Used by tests and debug assertions.
    pub fn validate(&self) -> Result<()> {
        for record in self.tasks.values() {
            if record.status.is_terminal() {
                return Err(Error::Internal(format!(
                    "{} is terminal ({}) but still present in the directory",
                    record.id, record.status
                )));
            }
            match record.status {
                TaskStatus::Created if record.owner_node.is_some() => {
                    return Err(Error::Internal(format!(
                        "{} is created but has an owner",
                        record.id
                    )));
                }
                TaskStatus::Running if record.owner_node.is_none() => {
                    return Err(Error::Internal(format!(
                        "{} is running but has no owner",
                        record.id
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl Default for TaskDirectory {
    fn default() -> Self {
        Self::empty()
    }
}

// ============================================================================
// DirectoryBuilder
// ============================================================================

/// Mutable view over a directory snapshot.
///
/// Every successful transition bumps the version once; `build()` returns
/// the new immutable snapshot. Builders are used and discarded inside a
/// single writer step and never escape it.
#[derive(Debug)]
pub struct DirectoryBuilder {
    base_version: u64,
    version: u64,
    next_task_id: u64,
    tasks: BTreeMap<TaskId, TaskRecord>,
}

impl DirectoryBuilder {
    /// Create a new task record in `Created` state, unassigned
    pub fn create_task(
        &mut self,
        action_type: impl Into<String>,
        payload: Value,
        executor_pool: impl Into<String>,
    ) -> TaskId {
        let id = TaskId(self.next_task_id);
        self.next_task_id += 1;

        let record = TaskRecord {
            id,
            action_type: action_type.into(),
            payload,
            executor_pool: executor_pool.into(),
            owner_node: None,
            last_owner: None,
            status: TaskStatus::Created,
            last_failure: None,
            created_at: Utc::now(),
        };

        self.tasks.insert(id, record);
        self.version += 1;
        id
    }

    /// `Created` -> `Running`: give the task an owner
    pub fn assign(&mut self, id: TaskId, node: NodeId) -> Result<()> {
        let record = self.get_mut(id)?;

        if record.status != TaskStatus::Created || record.owner_node.is_some() {
            return Err(Error::Internal(format!(
                "{} cannot be assigned while {} (owner: {:?})",
                id, record.status, record.owner_node
            )));
        }

        record.owner_node = Some(node);
        record.status = TaskStatus::Running;
        self.version += 1;
        Ok(())
    }

    /// `Running` -> `Created`: clear the owner so the task is reassigned
    /// on a later pass
    pub fn unassign(&mut self, id: TaskId, reason: impl Into<String>) -> Result<()> {
        let record = self.get_mut(id)?;

        if record.status != TaskStatus::Running {
            return Err(Error::Internal(format!(
                "{} cannot be unassigned while {}",
                id, record.status
            )));
        }

        record.last_owner = record.owner_node.take();
        record.status = TaskStatus::Created;
        record.last_failure = Some(reason.into());
        self.version += 1;
        Ok(())
    }

    /// `Running` -> `Completed`, pruned. Returns the terminal record.
    pub fn finish(&mut self, id: TaskId) -> Result<TaskRecord> {
        let mut record = self.take(id)?;

        if record.status != TaskStatus::Running {
            let status = record.status;
            self.tasks.insert(id, record);
            return Err(Error::Internal(format!(
                "{} cannot complete while {}",
                id, status
            )));
        }

        record.status = TaskStatus::Completed;
        self.version += 1;
        Ok(record)
    }

    /// Non-terminal -> `Failed`, pruned. Returns the terminal record.
    pub fn fail(&mut self, id: TaskId, reason: impl Into<String>) -> Result<TaskRecord> {
        let mut record = self.take(id)?;

        record.status = TaskStatus::Failed;
        record.last_failure = Some(reason.into());
        self.version += 1;
        Ok(record)
    }

    /// Any non-terminal state -> `Removed`, pruned. Returns the terminal
    /// record so the caller can signal the previous owner.
    pub fn remove(&mut self, id: TaskId) -> Result<TaskRecord> {
        let mut record = self.take(id)?;

        record.status = TaskStatus::Removed;
        self.version += 1;
        Ok(record)
    }

    pub fn get(&self, id: TaskId) -> Option<&TaskRecord> {
        self.tasks.get(&id)
    }

    /// All records in task-id order
    pub fn tasks(&self) -> impl Iterator<Item = &TaskRecord> {
        self.tasks.values()
    }

    /// Ids of tasks awaiting assignment
    pub fn pending_ids(&self) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|r| r.status == TaskStatus::Created && r.owner_node.is_none())
            .map(|r| r.id)
            .collect()
    }

    /// Ids of tasks owned by the given node
    pub fn owned_ids(&self, node: &NodeId) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|r| r.is_owned_by(node))
            .map(|r| r.id)
            .collect()
    }

    /// Number of tasks the node owns in the given executor pool
    pub fn owned_in_pool(&self, node: &NodeId, pool: &str) -> usize {
        self.tasks
            .values()
            .filter(|r| r.is_owned_by(node) && r.executor_pool == pool)
            .count()
    }

    /// Whether any transition was applied since the seed snapshot
    pub fn changed(&self) -> bool {
        self.version > self.base_version
    }

    pub fn build(self) -> TaskDirectory {
        TaskDirectory {
            version: self.version,
            next_task_id: self.next_task_id,
            tasks: self.tasks,
        }
    }

    fn get_mut(&mut self, id: TaskId) -> Result<&mut TaskRecord> {
        self.tasks.get_mut(&id).ok_or(Error::UnknownTask(id.0))
    }

    fn take(&mut self, id: TaskId) -> Result<TaskRecord> {
        self.tasks.remove(&id).ok_or(Error::UnknownTask(id.0))
    }
}

// ============================================================================
// DirectoryPublisher
// ============================================================================

/// Publication point for directory snapshots.
///
/// Owned by the cluster wiring and shared with whichever coordinator is
/// currently the writer; it outlives individual leaderships so node
/// subscriptions survive elections. Publication is an atomic reference
/// swap guarded against version regression.
#[derive(Clone)]
pub struct DirectoryPublisher {
    tx: Arc<watch::Sender<Arc<TaskDirectory>>>,
}

impl DirectoryPublisher {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Arc::new(TaskDirectory::empty()));
        Self { tx: Arc::new(tx) }
    }

    /// Publish a new snapshot. Rejects non-increasing versions.
    pub fn publish(&self, directory: TaskDirectory) -> Arc<TaskDirectory> {
        let next = Arc::new(directory);
        let accepted = self.tx.send_if_modified(|current| {
            if next.version() > current.version() {
                *current = Arc::clone(&next);
                true
            } else {
                false
            }
        });

        if !accepted {
            warn!(
                version = next.version(),
                current = self.tx.borrow().version(),
                "Rejected directory publication with non-increasing version"
            );
        }

        self.latest()
    }

    /// Latest published snapshot
    pub fn latest(&self) -> Arc<TaskDirectory> {
        Arc::clone(&self.tx.borrow())
    }

    /// Subscribe to publications. The receiver observes the latest
    /// snapshot at each wakeup; intermediate versions may be skipped.
    pub fn subscribe(&self) -> watch::Receiver<Arc<TaskDirectory>> {
        self.tx.subscribe()
    }
}

impl Default for DirectoryPublisher {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str) -> NodeId {
        NodeId::new(id)
    }

    #[test]
    fn test_create_and_assign() {
        let mut builder = TaskDirectory::empty().to_builder();
        let id = builder.create_task("reindex", json!({"index": "logs"}), "generic");
        builder.assign(id, node("node-1")).unwrap();
        let dir = builder.build();

        assert_eq!(dir.version(), 2);
        let record = dir.get(id).unwrap();
        assert_eq!(record.status, TaskStatus::Running);
        assert!(record.is_owned_by(&node("node-1")));
        dir.validate().unwrap();
    }

    #[test]
    fn test_task_ids_monotonic_never_reused() {
        let mut builder = TaskDirectory::empty().to_builder();
        let a = builder.create_task("x", json!(null), "generic");
        let b = builder.create_task("x", json!(null), "generic");
        builder.remove(a).unwrap();
        let dir = builder.build();

        let mut builder = dir.to_builder();
        let c = builder.create_task("x", json!(null), "generic");

        assert!(b > a);
        assert!(c > b);
    }

    #[test]
    fn test_reassignment_passes_through_unowned() {
        let mut builder = TaskDirectory::empty().to_builder();
        let id = builder.create_task("x", json!(null), "generic");
        builder.assign(id, node("node-1")).unwrap();

        // Direct handover to another node is not a legal transition
        assert!(builder.assign(id, node("node-2")).is_err());

        builder.unassign(id, "start failed").unwrap();
        let record = builder.get(id).unwrap();
        assert_eq!(record.status, TaskStatus::Created);
        assert_eq!(record.owner_node, None);
        assert_eq!(record.last_owner, Some(node("node-1")));
        assert_eq!(record.last_failure.as_deref(), Some("start failed"));

        builder.assign(id, node("node-2")).unwrap();
        builder.build().validate().unwrap();
    }

    #[test]
    fn test_version_bumps_once_per_transition() {
        let mut builder = TaskDirectory::empty().to_builder();
        let a = builder.create_task("x", json!(null), "generic");
        let b = builder.create_task("x", json!(null), "generic");
        builder.assign(a, node("node-1")).unwrap();
        builder.assign(b, node("node-1")).unwrap();
        builder.unassign(a, "node left").unwrap();
        let dir = builder.build();

        assert_eq!(dir.version(), 5);
    }

    #[test]
    fn test_finish_prunes_record() {
        let mut builder = TaskDirectory::empty().to_builder();
        let id = builder.create_task("x", json!(null), "generic");
        builder.assign(id, node("node-1")).unwrap();
        let record = builder.finish(id).unwrap();
        let dir = builder.build();

        assert_eq!(record.status, TaskStatus::Completed);
        assert!(!dir.contains(id));
    }

    #[test]
    fn test_finish_requires_running() {
        let mut builder = TaskDirectory::empty().to_builder();
        let id = builder.create_task("x", json!(null), "generic");
        assert!(builder.finish(id).is_err());
    }

    #[test]
    fn test_unknown_task() {
        let mut builder = TaskDirectory::empty().to_builder();
        let err = builder.assign(TaskId(42), node("node-1")).unwrap_err();
        assert!(matches!(err, Error::UnknownTask(42)));
    }

    #[test]
    fn test_owned_in_pool_counts() {
        let mut builder = TaskDirectory::empty().to_builder();
        for _ in 0..3 {
            let id = builder.create_task("x", json!(null), "ml");
            builder.assign(id, node("node-1")).unwrap();
        }
        let other = builder.create_task("y", json!(null), "generic");
        builder.assign(other, node("node-1")).unwrap();
        let dir = builder.build();

        assert_eq!(dir.owned_in_pool(&node("node-1"), "ml"), 3);
        assert_eq!(dir.owned_in_pool(&node("node-1"), "generic"), 1);
        assert_eq!(dir.owned_in_pool(&node("node-2"), "ml"), 0);
    }

    #[test]
    fn test_publisher_rejects_version_regression() {
        let publisher = DirectoryPublisher::new();

        let mut builder = TaskDirectory::empty().to_builder();
        builder.create_task("x", json!(null), "generic");
        let newer = builder.build();

        publisher.publish(newer);
        assert_eq!(publisher.latest().version(), 1);

        // Re-publishing the empty directory must not roll the version back
        publisher.publish(TaskDirectory::empty());
        assert_eq!(publisher.latest().version(), 1);
    }
}
