//! Task Execution Handle - one running task instance on its owning node
//!
//! A handle wraps a spawned handler invocation with a cooperative
//! cancellation token and a completion report. Handles are runtime-only
//! state; they never appear in the Task Directory.

use crate::directory::TaskId;
use crate::registry::ActionHandler;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tether_foundation::Result;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

// ============================================================================
// CancellationToken
// ============================================================================

struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation flag.
///
/// Handlers either poll `is_cancelled()` at convenient points or select
/// on `cancelled()`. Cancelling is non-blocking and idempotent.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Completes once the token is cancelled
    pub async fn cancelled(&self) {
        // The notified future must be created before the flag check so a
        // cancel between check and await is not missed.
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ============================================================================
// TaskCompletion
// ============================================================================

/// Outcome of one handler invocation, delivered back to the node service.
/// Suppressed entirely when the handle was cancelled locally.
#[derive(Debug)]
pub struct TaskCompletion {
    pub task_id: TaskId,
    pub outcome: Result<Value>,
}

// ============================================================================
// ExecutionHandle
// ============================================================================

/// A cancellable wrapper around one running task on this node.
///
/// Exactly one handle exists per task id per node at any time.
pub struct ExecutionHandle {
    task_id: TaskId,
    token: CancellationToken,
    locally_cancelled: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl ExecutionHandle {
    /// Spawn the handler and return its handle. The completion is sent on
    /// `completions` when the handler returns, unless the handle was
    /// locally cancelled first.
    pub fn spawn(
        task_id: TaskId,
        handler: Arc<dyn ActionHandler>,
        payload: Value,
        completions: mpsc::UnboundedSender<TaskCompletion>,
    ) -> Self {
        let token = CancellationToken::new();
        let locally_cancelled = Arc::new(AtomicBool::new(false));

        let join = {
            let token = token.clone();
            let locally_cancelled = Arc::clone(&locally_cancelled);
            tokio::spawn(async move {
                let outcome = handler.run(payload, token).await;

                if locally_cancelled.load(Ordering::SeqCst) {
                    // The directory has already moved on; the result is
                    // nobody's business.
                    debug!(task = %task_id, "Suppressing completion of locally cancelled task");
                    return;
                }

                let _ = completions.send(TaskCompletion { task_id, outcome });
            })
        };

        Self {
            task_id,
            token,
            locally_cancelled,
            join,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancel this execution as a node-local event: the handler is asked
    /// to stop and its eventual result is not reported anywhere.
    pub fn cancel_local(&self) {
        self.locally_cancelled.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    /// Hard-stop the spawned handler. Only used on node shutdown.
    pub fn abort(&self) {
        self.join.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl std::fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("task_id", &self.task_id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
