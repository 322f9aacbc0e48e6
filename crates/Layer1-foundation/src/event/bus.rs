//! Event Bus - cluster-wide event broadcast
//!
//! Async publish/subscribe for [`ClusterEvent`]s. Listeners are invoked
//! inline on publish; stream consumers use the broadcast receiver.

use super::types::{ClusterEvent, EventCategory, EventSeverity};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, trace};

// ============================================================================
// EventListener
// ============================================================================

/// Event listener id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Implemented by components that want events pushed to them.
#[async_trait]
pub trait EventListener: Send + Sync {
    /// Listener name (for debugging)
    fn name(&self) -> &str;

    /// Categories of interest (None means all events)
    fn categories(&self) -> Option<Vec<EventCategory>> {
        None
    }

    async fn on_event(&self, event: &ClusterEvent);
}

// ============================================================================
// EventFilter
// ============================================================================

/// Event filter
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub categories: Option<Vec<EventCategory>>,

    /// Event type patterns (prefix match)
    pub event_types: Option<Vec<String>>,

    pub min_severity: Option<EventSeverity>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_categories(mut self, categories: Vec<EventCategory>) -> Self {
        self.categories = Some(categories);
        self
    }

    pub fn with_event_types(mut self, types: Vec<String>) -> Self {
        self.event_types = Some(types);
        self
    }

    pub fn with_min_severity(mut self, severity: EventSeverity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    pub fn matches(&self, event: &ClusterEvent) -> bool {
        if let Some(ref cats) = self.categories {
            if !cats.contains(&event.category) {
                return false;
            }
        }

        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| event.event_type.starts_with(t)) {
                return false;
            }
        }

        if let Some(min_sev) = self.min_severity {
            if event.severity < min_sev {
                return false;
            }
        }

        true
    }
}

// ============================================================================
// EventBus
// ============================================================================

/// Event bus configuration
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Broadcast channel capacity
    pub channel_capacity: usize,

    /// Number of events kept in history
    pub history_size: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            history_size: 100,
        }
    }
}

struct RegisteredListener {
    listener: Arc<dyn EventListener>,
    filter: Option<EventFilter>,
}

/// Broadcasts events to registered listeners and stream subscribers.
pub struct EventBus {
    config: EventBusConfig,
    sender: broadcast::Sender<ClusterEvent>,
    listeners: RwLock<HashMap<ListenerId, RegisteredListener>>,
    listener_counter: AtomicU64,
    history: RwLock<Vec<ClusterEvent>>,
    event_count: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    pub fn with_config(config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity);

        Self {
            config,
            sender,
            listeners: RwLock::new(HashMap::new()),
            listener_counter: AtomicU64::new(0),
            history: RwLock::new(Vec::new()),
            event_count: AtomicU64::new(0),
        }
    }

    /// Register a listener
    pub async fn subscribe(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        self.subscribe_with_filter(listener, None).await
    }

    /// Register a listener with a filter
    pub async fn subscribe_with_filter(
        &self,
        listener: Arc<dyn EventListener>,
        filter: Option<EventFilter>,
    ) -> ListenerId {
        let id = ListenerId(self.listener_counter.fetch_add(1, Ordering::SeqCst));

        debug!(
            listener_name = listener.name(),
            listener_id = %id,
            "Registering event listener"
        );

        let mut listeners = self.listeners.write().await;
        listeners.insert(id, RegisteredListener { listener, filter });

        id
    }

    /// Unregister a listener
    pub async fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().await;
        let removed = listeners.remove(&id).is_some();

        if removed {
            debug!(listener_id = %id, "Unregistered event listener");
        }

        removed
    }

    /// Publish an event
    pub async fn publish(&self, event: ClusterEvent) {
        self.event_count.fetch_add(1, Ordering::SeqCst);

        {
            let mut history = self.history.write().await;
            history.push(event.clone());

            if history.len() > self.config.history_size {
                history.remove(0);
            }
        }

        // Stream subscribers; a send error just means nobody is listening
        let _ = self.sender.send(event.clone());

        let listeners = self.listeners.read().await;
        for (id, registered) in listeners.iter() {
            let should_deliver = match &registered.filter {
                Some(filter) => filter.matches(&event),
                None => match registered.listener.categories() {
                    Some(cats) => cats.contains(&event.category),
                    None => true,
                },
            };

            if should_deliver {
                trace!(
                    listener_id = %id,
                    listener_name = registered.listener.name(),
                    event_type = %event.event_type,
                    "Delivering event to listener"
                );

                registered.listener.on_event(&event).await;
            }
        }
    }

    /// Broadcast receiver (stream style)
    pub fn receiver(&self) -> broadcast::Receiver<ClusterEvent> {
        self.sender.subscribe()
    }

    /// Most recent events, newest first
    pub async fn history(&self, limit: Option<usize>) -> Vec<ClusterEvent> {
        let history = self.history.read().await;
        let limit = limit.unwrap_or(history.len());
        history.iter().rev().take(limit).cloned().collect()
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.read().await.len()
    }

    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
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
    use std::sync::atomic::AtomicUsize;

    struct TestListener {
        name: String,
        count: AtomicUsize,
    }

    impl TestListener {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                count: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventListener for TestListener {
        fn name(&self) -> &str {
            &self.name
        }

        async fn on_event(&self, _event: &ClusterEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_event_bus_basic() {
        let bus = EventBus::new();

        let listener = Arc::new(TestListener::new("test"));
        let id = bus.subscribe(listener.clone()).await;

        assert_eq!(bus.listener_count().await, 1);

        let event = ClusterEvent::new("task.started", EventCategory::Task);
        bus.publish(event).await;

        assert_eq!(listener.call_count(), 1);

        bus.unsubscribe(id).await;
        assert_eq!(bus.listener_count().await, 0);
    }

    #[tokio::test]
    async fn test_event_filter() {
        let filter = EventFilter::new()
            .with_categories(vec![EventCategory::Task])
            .with_event_types(vec!["task.".to_string()]);

        let task_event = ClusterEvent::new("task.completed", EventCategory::Task);
        let system_event = ClusterEvent::new("system.started", EventCategory::System);

        assert!(filter.matches(&task_event));
        assert!(!filter.matches(&system_event));
    }

    #[tokio::test]
    async fn test_event_history_bounded() {
        let config = EventBusConfig {
            history_size: 5,
            ..Default::default()
        };
        let bus = EventBus::with_config(config);

        for i in 0..10 {
            let event = ClusterEvent::new(format!("task.tick.{}", i), EventCategory::Task);
            bus.publish(event).await;
        }

        let history = bus.history(None).await;
        assert_eq!(history.len(), 5);
        // Newest first
        assert_eq!(history[0].event_type, "task.tick.9");
    }
}
