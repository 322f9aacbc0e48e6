//! # tether-foundation
//!
//! Foundation layer for Tether. Cross-layer primitives with no
//! coordination logic of their own:
//!
//! - Central error type and `Result` alias
//! - Cluster event bus (publish/subscribe, filters, bounded history)
//! - Node and cluster configuration

pub mod config;
pub mod error;
pub mod event;

pub use config::{ClusterConfig, NodeConfig};
pub use error::{Error, Result};
pub use event::{
    ClusterEvent, EventBus, EventBusConfig, EventCategory, EventFilter, EventId, EventListener,
    EventSeverity, ListenerId,
};
