//! Config - node and cluster topology settings
//!
//! - `node.rs` - `NodeConfig`, `ClusterConfig` (TOML-loaded)

mod node;

pub use node::{ClusterConfig, NodeConfig};
