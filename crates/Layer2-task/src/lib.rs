//! # tether-task
//!
//! Persistent task coordination for clustered services. Tasks submitted
//! once keep running somewhere in the cluster until they complete, fail
//! terminally, or are removed - surviving the loss of the node running
//! them and of the node that scheduled them.
//!
//! ## Architecture
//!
//! - [`TaskDirectory`] - authoritative, versioned record of every task,
//!   published as immutable snapshots
//! - [`DirectoryCoordinator`] - leader-only single writer applying all
//!   task-state transitions in a total order
//! - [`NodeService`] - per-node reconciliation loop starting and
//!   cancelling local executions to match the directory
//! - [`ActionRegistry`] - node-local mapping from action type to handler
//! - [`ExecutionHandle`] - one cancellable running task instance
//! - [`TaskClient`] - submit / cancel / await API bound to the leader
//! - [`TaskCluster`] - in-process wiring of all of the above

pub mod assign;
pub mod client;
pub mod cluster;
pub mod coordinator;
pub mod directory;
pub mod handle;
pub mod membership;
pub mod node;
pub mod registry;

// Directory
pub use directory::{
    DirectoryBuilder, DirectoryPublisher, TaskDirectory, TaskId, TaskRecord, TaskStatus,
};

// Coordination
pub use coordinator::{
    CoordinatorHandle, CoordinatorLink, DirectoryCoordinator, NodeSignal, TaskOutcome,
};

// Node side
pub use handle::{CancellationToken, ExecutionHandle, TaskCompletion};
pub use node::{NodeService, NodeServiceHandle};
pub use registry::{ActionHandler, ActionHolder, ActionRegistry};

// Cluster surface
pub use assign::{AssignmentPolicy, LeastTasks, LowestNodeId, NodeCandidate};
pub use client::{CompletionWaiter, TaskClient};
pub use cluster::TaskCluster;
pub use membership::{ClusterMembership, MembershipEvent, NodeId, NodeInfo};
