//! Action Registry - node-local mapping from action type to handler
//!
//! Registration is rare and serialized; lookups happen on every
//! reconciliation pass. The registry therefore keeps its entries in an
//! immutable snapshot map behind an `Arc`: every mutation builds a new map
//! and swaps the reference, and readers clone the `Arc` without ever
//! blocking on a writer.

use crate::handle::CancellationToken;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tether_foundation::{Error, Result};
use tracing::{debug, warn};

// ============================================================================
// ActionHandler
// ============================================================================

/// The handler contract for a registered action type.
///
/// Given the task's payload and a cancellation token, run to completion
/// and return exactly once. An `Err` classified retryable by
/// [`Error::is_retryable`] causes the task to be reassigned to another
/// node; any other error terminates it.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn run(&self, payload: Value, cancel: CancellationToken) -> Result<Value>;
}

// ============================================================================
// ActionHolder
// ============================================================================

/// A registered action: handler plus the executor pool it runs in
pub struct ActionHolder {
    pub action_type: String,
    pub executor_pool: String,
    pub handler: Arc<dyn ActionHandler>,
}

impl std::fmt::Debug for ActionHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionHolder")
            .field("action_type", &self.action_type)
            .field("executor_pool", &self.executor_pool)
            .finish()
    }
}

// ============================================================================
// ActionRegistry
// ============================================================================

type Snapshot = Arc<HashMap<String, Arc<ActionHolder>>>;

/// Node-local action registry. Not cluster state: what this node tells
/// the cluster about its registrations travels separately in its
/// membership advertisement.
pub struct ActionRegistry {
    // Writers serialize on the lock; readers clone the Arc and drop the
    // lock before touching the map.
    snapshot: RwLock<Snapshot>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Register a handler for an action type.
    ///
    /// A duplicate registration overwrites the previous holder (last
    /// write wins locally) and surfaces `DuplicateAction` as a warning;
    /// callers may ignore it.
    pub fn register(
        &self,
        action_type: impl Into<String>,
        executor_pool: impl Into<String>,
        handler: Arc<dyn ActionHandler>,
    ) -> Result<()> {
        let action_type = action_type.into();
        let holder = Arc::new(ActionHolder {
            action_type: action_type.clone(),
            executor_pool: executor_pool.into(),
            handler,
        });

        let mut guard = self.snapshot.write();
        let mut next: HashMap<_, _> = guard.as_ref().clone();
        let previous = next.insert(action_type.clone(), holder);
        *guard = Arc::new(next);
        drop(guard);

        if previous.is_some() {
            warn!(action = %action_type, "Action type re-registered; previous handler replaced");
            return Err(Error::DuplicateAction(action_type));
        }

        debug!(action = %action_type, "Registered action handler");
        Ok(())
    }

    /// Remove a registration if present
    pub fn unregister(&self, action_type: &str) -> bool {
        let mut guard = self.snapshot.write();
        if !guard.contains_key(action_type) {
            return false;
        }
        let mut next: HashMap<_, _> = guard.as_ref().clone();
        next.remove(action_type);
        *guard = Arc::new(next);
        true
    }

    /// Look up the holder for an action type
    pub fn lookup(&self, action_type: &str) -> Result<Arc<ActionHolder>> {
        let snapshot = Arc::clone(&self.snapshot.read());
        snapshot
            .get(action_type)
            .cloned()
            .ok_or_else(|| Error::UnknownAction(action_type.to_string()))
    }

    pub fn contains(&self, action_type: &str) -> bool {
        self.snapshot.read().contains_key(action_type)
    }

    pub fn len(&self) -> usize {
        self.snapshot.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.read().is_empty()
    }

    /// `action_type -> executor_pool` map for this node's membership
    /// advertisement
    pub fn advertised_actions(&self) -> BTreeMap<String, String> {
        let snapshot = Arc::clone(&self.snapshot.read());
        snapshot
            .values()
            .map(|h| (h.action_type.clone(), h.executor_pool.clone()))
            .collect()
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
