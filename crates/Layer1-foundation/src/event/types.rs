//! Event types shared across Tether layers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Event ID
// ============================================================================

/// Unique event identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Event Category
// ============================================================================

/// Event category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Process-level events (startup, shutdown, config)
    System,
    /// Membership events (node join/leave, leadership)
    Membership,
    /// Directory publications and transitions
    Directory,
    /// Task lifecycle on a node (started, completed, failed, cancelled)
    Task,
    /// Error events
    Error,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Membership => "membership",
            Self::Directory => "directory",
            Self::Task => "task",
            Self::Error => "error",
        }
    }
}

// ============================================================================
// Event Severity
// ============================================================================

/// Event severity, ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

impl Default for EventSeverity {
    fn default() -> Self {
        Self::Info
    }
}

// ============================================================================
// ClusterEvent
// ============================================================================

/// An observable event emitted by the coordination core.
///
/// `event_type` is a dotted name (`task.started`, `membership.node_left`);
/// `source` identifies the emitting node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub id: EventId,
    pub event_type: String,
    pub category: EventCategory,
    pub severity: EventSeverity,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    /// Structured event data (task id, node id, reason, ...)
    pub payload: Value,
}

impl ClusterEvent {
    pub fn new(event_type: impl Into<String>, category: EventCategory) -> Self {
        Self {
            id: EventId::new(),
            event_type: event_type.into(),
            category,
            severity: EventSeverity::default(),
            source: String::new(),
            timestamp: Utc::now(),
            payload: Value::Null,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_severity(mut self, severity: EventSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}
