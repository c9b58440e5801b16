//! Raft consensus implementation
//! This module provides a from-scratch Raft core: leader election, log
//! replication with fast-rollback conflict recovery, snapshot install, and a
//! commit/apply pipeline feeding an upstream state machine over a channel.

pub mod election;
pub mod log;
pub mod node;
pub mod replication;
pub mod snapshot;
pub mod storage;

use serde::{Deserialize, Serialize};
use tokio::time::Duration;

/// Base election timeout; the actual deadline adds a per-reset random jitter.
pub const ELECTION_TIMEOUT: Duration = Duration::from_millis(800);
/// Upper bound (exclusive) of the randomized addition to the election timeout.
pub const ELECTION_JITTER_MS: u64 = 200;
/// Leader heartbeat interval, well inside the election window.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(300);

/// Role of a node within its replication group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// One replicated log entry. The command is opaque to Raft; the upstream
/// serializes and interprets it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub command: Vec<u8>,
}

/// Message delivered to the upstream state machine, in strict index order.
/// A `Snapshot` jumps `last_applied` forward once the upstream accepts it via
/// `Raft::cond_install_snapshot`.
#[derive(Debug, Clone)]
pub enum ApplyMsg {
    Command { index: u64, command: Vec<u8> },
    Snapshot { index: u64, term: u64, data: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

/// Reply to AppendEntries. On failure the x-fields carry the fast-rollback
/// hint: `x_term == -1` means the follower's log is shorter than
/// `prev_log_index` and `x_len` is its length; otherwise `x_term` is the
/// conflicting term and `x_index` the first index holding it.
#[derive(Debug, Clone, Default)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    pub rejected_by_term: bool,
    pub next_index: u64,
    pub x_term: i64,
    pub x_index: u64,
    pub x_len: u64,
}

#[derive(Debug, Clone)]
pub struct InstallSnapshotArgs {
    pub term: u64,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub snapshot: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct InstallSnapshotReply {
    pub term: u64,
}
