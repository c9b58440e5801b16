//! Runtime configuration for the replica node: identity, listen addresses,
//! storage path, and the peer directory. A node refuses to start on a config
//! that cannot describe a working replication group.

use std::collections::HashSet;
use std::sync::Mutex;

use log::{error, warn};
use once_cell::sync::OnceCell;
use serde::Deserialize;

/// Global configuration instance
static INSTANCE: OnceCell<Mutex<RuntimeConfig>> = OnceCell::new();

/// Returns a reference to the global configuration instance
pub fn instance() -> &'static Mutex<RuntimeConfig> {
    INSTANCE.get_or_init(|| Mutex::new(RuntimeConfig::new()))
}

/// One node in the replication group
#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    /// Unique identifier for the node
    pub id: u64,
    /// Dial address of the node's raft service
    pub addr: String,
}

/// Runtime configuration for the replica node
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Current node's ID; must appear in `node_list`
    pub id: u64,
    /// Listen address for raft RPCs
    pub addr: String,
    /// Listen address for the metrics scrape endpoint
    pub metrics_addr: String,
    /// Base path for persisted raft state
    pub base_path: String,
    /// Upstream snapshots its state every this many applied commands;
    /// 0 disables snapshotting
    pub snapshot_threshold: u64,
    /// Whether the node should generate sample commands while it leads
    pub seed_traffic: bool,
    /// Every node in the replication group, this one included
    pub node_list: Vec<NodeConfig>,
}

impl RuntimeConfig {
    /// Creates a new RuntimeConfig with default values
    pub fn new() -> Self {
        RuntimeConfig {
            id: 1,
            addr: "0.0.0.0:4000".to_string(),
            metrics_addr: "0.0.0.0:4010".to_string(),
            base_path: "./data".to_string(),
            snapshot_threshold: 1000,
            seed_traffic: false,
            node_list: Vec::new(),
        }
    }

    /// Loads and validates the configuration from a TOML file, installing it
    /// as the global instance. Returns None when the node must not start:
    /// a raft node without a usable peer directory cannot form a group.
    pub fn from_toml(path: &str) -> Option<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                error!("cannot read config file {}: {}", path, e);
                return None;
            }
        };
        let config: RuntimeConfig = match toml::from_str(&contents) {
            Ok(c) => c,
            Err(e) => {
                error!("config file {} is malformed: {}", path, e);
                return None;
            }
        };
        if let Err(reason) = config.validate() {
            error!("config file {} rejected: {}", path, reason);
            return None;
        }
        instance().lock().unwrap().clone_from(&config);
        Some(config)
    }

    /// A config is usable when the peer directory is coherent: non-empty,
    /// free of duplicate ids, every peer dialable, and this node a member.
    fn validate(&self) -> Result<(), String> {
        if self.node_list.is_empty() {
            return Err("node_list is empty".to_string());
        }
        if !self.node_list.iter().any(|n| n.id == self.id) {
            return Err(format!("node_list does not contain this node's id {}", self.id));
        }
        let mut seen = HashSet::new();
        for node in &self.node_list {
            if !seen.insert(node.id) {
                return Err(format!("duplicate id {} in node_list", node.id));
            }
            if node.addr.is_empty() {
                return Err(format!("node {} has an empty addr", node.id));
            }
        }
        if self.node_list.len() % 2 == 0 {
            warn!(
                "node_list has {} members; an even group tolerates no more failures than one smaller",
                self.node_list.len()
            );
        }
        Ok(())
    }
}
