//! Upstream state machine seam and the small key/value machine the node
//! binary runs behind it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Trait for a state machine fed by the replicated log
/// The state machine applies committed commands and produces/adopts
/// snapshots of its own state.
pub trait StateMachine {
    /// Apply a committed command to the state machine
    fn apply(&mut self, index: u64, data: &[u8]);

    /// Create a snapshot of the current state machine state
    fn snapshot(&self) -> Vec<u8>;

    /// Restore the state machine from a snapshot
    fn on_snapshot(&mut self, last_index: u64, last_term: u64, data: &[u8]);
}

/// Command applied to [`KvState`], serialized with bincode by the proposer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvCommand {
    pub key: String,
    pub value: String,
}

/// Minimal key/value machine used by the node binary and the benchmark.
#[derive(Debug, Default, Clone)]
pub struct KvState {
    map: BTreeMap<String, String>,
    applied_index: u64,
}

impl KvState {
    pub fn new() -> KvState {
        KvState::default()
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.map.get(key)
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl StateMachine for KvState {
    fn apply(&mut self, index: u64, data: &[u8]) {
        match bincode::deserialize::<KvCommand>(data) {
            Ok(cmd) => {
                self.map.insert(cmd.key, cmd.value);
                self.applied_index = index;
            }
            Err(e) => log::warn!("undecodable command at index {}: {}", index, e),
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        bincode::serialize(&(&self.map, self.applied_index))
            .expect("kv state is always encodable")
    }

    fn on_snapshot(&mut self, last_index: u64, _last_term: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        // The blob embeds the index it was taken at, which lets a cold start
        // restore without knowing the boundary up front.
        match bincode::deserialize::<(BTreeMap<String, String>, u64)>(data) {
            Ok((map, embedded_index)) => {
                self.map = map;
                self.applied_index = embedded_index.max(last_index);
            }
            Err(e) => log::warn!("undecodable snapshot at index {}: {}", last_index, e),
        }
    }
}
