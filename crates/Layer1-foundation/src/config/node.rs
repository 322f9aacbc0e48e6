//! Node and cluster topology configuration

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Configuration for a single node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identifier, unique within the cluster
    pub node_id: String,

    /// Executor pools this node runs, with their capacity
    /// (maximum tasks owned concurrently per pool)
    #[serde(default = "default_pools")]
    pub pools: BTreeMap<String, usize>,
}

fn default_pools() -> BTreeMap<String, usize> {
    BTreeMap::from([("generic".to_string(), 4)])
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            pools: default_pools(),
        }
    }

    pub fn with_pool(mut self, name: impl Into<String>, capacity: usize) -> Self {
        self.pools.insert(name.into(), capacity);
        self
    }
}

/// Topology for an in-process cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: (1..=3).map(|i| NodeConfig::new(format!("node-{}", i))).collect(),
        }
    }
}

impl ClusterConfig {
    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self =
            toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;

        if config.nodes.is_empty() {
            return Err(Error::Config("cluster config has no nodes".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for node in &config.nodes {
            if !seen.insert(node.node_id.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate node id in cluster config: {}",
                    node.node_id
                )));
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_topology() {
        let config = ClusterConfig::default();
        assert_eq!(config.nodes.len(), 3);
        assert_eq!(config.nodes[0].node_id, "node-1");
        assert_eq!(config.nodes[0].pools.get("generic"), Some(&4));
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[[nodes]]
node_id = "alpha"

[nodes.pools]
generic = 2
ml = 1

[[nodes]]
node_id = "beta"
"#
        )
        .unwrap();

        let config = ClusterConfig::load(file.path()).unwrap();
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[0].pools.get("ml"), Some(&1));
        // Unspecified pools fall back to the default
        assert_eq!(config.nodes[1].pools.get("generic"), Some(&4));
    }

    #[test]
    fn test_duplicate_node_id_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[[nodes]]
node_id = "alpha"

[[nodes]]
node_id = "alpha"
"#
        )
        .unwrap();

        let err = ClusterConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
