//! Durable storage for Raft state.
//! State and snapshot are written as an atomically-paired blob pair: every
//! save rewrites one file through a temp-file-then-rename, so a crash leaves
//! either the old pair or the new pair, never a mix.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::LogEntry;

/// Persisted Raft state in codec order. `logs` includes slot 0, which carries
/// only the snapshot boundary term.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PersistedState {
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub offset: u64,
    pub last_log_index: u64,
    pub logs: Vec<LogEntry>,
}

impl PersistedState {
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("raft state is always encodable")
    }

    /// A blob that fails to decode is treated as "no prior state".
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.is_empty() {
            return None;
        }
        match bincode::deserialize::<PersistedState>(data) {
            Ok(state) => Some(state),
            Err(e) => {
                log::warn!("failed to decode persisted raft state: {}", e);
                None
            }
        }
    }
}

/// Handle to the durable store. Writes happen under the caller's state lock
/// and must complete before any reply that depends on them is sent.
pub trait Storage: Send + Sync + 'static {
    fn save_state(&self, state: &[u8]) -> io::Result<()>;
    fn save_state_and_snapshot(&self, state: &[u8], snapshot: &[u8]) -> io::Result<()>;
    fn read_state(&self) -> Vec<u8>;
    fn read_snapshot(&self) -> Vec<u8>;
}

#[derive(Serialize, Deserialize, Default)]
struct BlobPair {
    state: Vec<u8>,
    snapshot: Vec<u8>,
}

/// File-backed storage. Both blobs live in one file under the base path so
/// the pair is replaced in a single rename.
pub struct FileStorage {
    path: PathBuf,
    cached: Mutex<BlobPair>,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(base_path: P) -> io::Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        let path = base_path.join("raft_state");

        let cached = if path.exists() {
            let data = fs::read(&path)?;
            bincode::deserialize(&data).unwrap_or_else(|e| {
                log::warn!("unreadable raft state file, starting empty: {}", e);
                BlobPair::default()
            })
        } else {
            BlobPair::default()
        };

        Ok(FileStorage {
            path,
            cached: Mutex::new(cached),
        })
    }

    fn write_pair(&self, pair: &BlobPair) -> io::Result<()> {
        let data = bincode::serialize(pair)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, &data)?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn save_state(&self, state: &[u8]) -> io::Result<()> {
        let mut cached = self.cached.lock().unwrap();
        cached.state = state.to_vec();
        self.write_pair(&cached)
    }

    fn save_state_and_snapshot(&self, state: &[u8], snapshot: &[u8]) -> io::Result<()> {
        let mut cached = self.cached.lock().unwrap();
        cached.state = state.to_vec();
        cached.snapshot = snapshot.to_vec();
        self.write_pair(&cached)
    }

    fn read_state(&self) -> Vec<u8> {
        self.cached.lock().unwrap().state.clone()
    }

    fn read_snapshot(&self) -> Vec<u8> {
        self.cached.lock().unwrap().snapshot.clone()
    }
}

/// In-memory storage for tests and benchmarks. Survives a simulated restart
/// as long as the same instance is handed to the next incarnation.
pub struct MemStorage {
    cached: Mutex<BlobPair>,
}

impl MemStorage {
    pub fn new() -> Self {
        MemStorage {
            cached: Mutex::new(BlobPair::default()),
        }
    }
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemStorage {
    fn save_state(&self, state: &[u8]) -> io::Result<()> {
        self.cached.lock().unwrap().state = state.to_vec();
        Ok(())
    }

    fn save_state_and_snapshot(&self, state: &[u8], snapshot: &[u8]) -> io::Result<()> {
        let mut cached = self.cached.lock().unwrap();
        cached.state = state.to_vec();
        cached.snapshot = snapshot.to_vec();
        Ok(())
    }

    fn read_state(&self) -> Vec<u8> {
        self.cached.lock().unwrap().state.clone()
    }

    fn read_snapshot(&self) -> Vec<u8> {
        self.cached.lock().unwrap().snapshot.clone()
    }
}
