//! Cluster event system
//!
//! - `types.rs` - event ids, categories, severities, `ClusterEvent`
//! - `bus.rs` - publish/subscribe bus with filters and bounded history

mod bus;
mod types;

pub use bus::{EventBus, EventBusConfig, EventFilter, EventListener, ListenerId};
pub use types::{ClusterEvent, EventCategory, EventId, EventSeverity};
