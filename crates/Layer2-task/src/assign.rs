//! Assignment policies - how the coordinator picks an owner for a task
//!
//! The selection step is pluggable. Policies are pure functions over the
//! candidate set; the coordinator precomputes each candidate's current
//! ownership so policies never touch directory internals.

use crate::membership::{NodeId, NodeInfo};

// ============================================================================
// NodeCandidate
// ============================================================================

/// A live node considered for assignment, with its current load in the
/// task's executor pool.
#[derive(Debug, Clone)]
pub struct NodeCandidate {
    pub info: NodeInfo,

    /// Tasks this node already owns in the task's pool
    pub owned_in_pool: usize,
}

impl NodeCandidate {
    /// Remaining capacity in the given pool
    pub fn spare_capacity(&self, pool: &str) -> usize {
        self.info
            .pool_capacity(pool)
            .saturating_sub(self.owned_in_pool)
    }

    fn eligible(&self, action_type: &str, pool: &str) -> bool {
        self.info.advertises_action(action_type) && self.spare_capacity(pool) > 0
    }
}

// ============================================================================
// AssignmentPolicy
// ============================================================================

/// Picks the owner for one pending task, or `None` when no candidate is
/// eligible (the task then stays pending and is retried on the next
/// assignment pass).
pub trait AssignmentPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn select(
        &self,
        action_type: &str,
        executor_pool: &str,
        candidates: &[NodeCandidate],
    ) -> Option<NodeId>;
}

// ============================================================================
// Policies
// ============================================================================

/// Default policy: among eligible nodes, pick the lowest node id.
/// Fully deterministic for a given directory and membership view.
#[derive(Debug, Default)]
pub struct LowestNodeId;

impl AssignmentPolicy for LowestNodeId {
    fn name(&self) -> &'static str {
        "lowest-node-id"
    }

    fn select(
        &self,
        action_type: &str,
        executor_pool: &str,
        candidates: &[NodeCandidate],
    ) -> Option<NodeId> {
        candidates
            .iter()
            .filter(|c| c.eligible(action_type, executor_pool))
            .map(|c| c.info.id.clone())
            .min()
    }
}

/// Load-aware policy: pick the eligible node owning the fewest tasks in
/// the pool; ties broken by lowest node id.
#[derive(Debug, Default)]
pub struct LeastTasks;

impl AssignmentPolicy for LeastTasks {
    fn name(&self) -> &'static str {
        "least-tasks"
    }

    fn select(
        &self,
        action_type: &str,
        executor_pool: &str,
        candidates: &[NodeCandidate],
    ) -> Option<NodeId> {
        candidates
            .iter()
            .filter(|c| c.eligible(action_type, executor_pool))
            .min_by_key(|c| (c.owned_in_pool, c.info.id.clone()))
            .map(|c| c.info.id.clone())
    }
}

// ============================================================================
// Tests
// ============================================================================
