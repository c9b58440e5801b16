//! The Raft node: shared state, lifecycle, and the background loops.
//!
//! All non-atomic state sits behind one coarse mutex. The guard is never held
//! across an await: outbound RPCs, apply-channel sends, and timer sleeps all
//! happen with the lock released, and every routine re-validates term and
//! role after reacquiring it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rand::Rng;
use tokio::sync::{mpsc, Notify};
use tokio::time::{Duration, Instant};

use super::log::LogStore;
use super::storage::{PersistedState, Storage};
use super::{ApplyMsg, LogEntry, Role, ELECTION_JITTER_MS, ELECTION_TIMEOUT};
use crate::transport::RaftTransport;

/// Mutable state guarded by the main lock.
pub(crate) struct RaftInner {
    pub(crate) role: Role,
    pub(crate) current_term: u64,
    pub(crate) voted_for: Option<u64>,
    pub(crate) log: LogStore,
    pub(crate) snapshot: Vec<u8>,

    pub(crate) commit_index: u64,
    pub(crate) last_applied: u64,
    pub(crate) votes: usize,

    /// Leader-only, reinitialized on every election win.
    pub(crate) next_index: HashMap<u64, u64>,
    pub(crate) match_index: HashMap<u64, u64>,
}

/// Election deadline under its own lock, so RPC handlers can refresh it
/// without contending on the main state lock.
pub(crate) struct ElectionTimer {
    pub(crate) deadline: Instant,
}

impl ElectionTimer {
    fn new() -> Self {
        let mut timer = ElectionTimer {
            deadline: Instant::now(),
        };
        timer.fresh();
        timer
    }

    /// Randomized per reset; a fixed per-process jitter would livelock
    /// elections on split votes.
    pub(crate) fn fresh(&mut self) {
        let jitter = rand::thread_rng().gen_range(0..ELECTION_JITTER_MS);
        self.deadline = Instant::now() + ELECTION_TIMEOUT + Duration::from_millis(jitter);
    }
}

pub struct Raft {
    pub(crate) me: u64,
    pub(crate) peers: Vec<u64>,
    pub(crate) majority: usize,

    pub(crate) inner: Mutex<RaftInner>,
    pub(crate) timer: Mutex<ElectionTimer>,
    dead: AtomicBool,

    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) transport: Arc<dyn RaftTransport>,
    pub(crate) apply_tx: mpsc::Sender<ApplyMsg>,

    /// Wakes the applier when `commit_index` advances.
    pub(crate) apply_notify: Notify,
    /// Wakes one replication worker per peer; a stored permit means no
    /// wakeup is ever lost between dispatches.
    pub(crate) replicate_notify: HashMap<u64, Arc<Notify>>,
}

impl Raft {
    /// Construct a node, restore any persisted state, and spawn the ticker,
    /// applier, and one replication worker per peer. `peers` contains every
    /// node id in the group, including `me`.
    pub fn new(
        peers: Vec<u64>,
        me: u64,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn RaftTransport>,
        apply_tx: mpsc::Sender<ApplyMsg>,
    ) -> Arc<Raft> {
        assert!(peers.contains(&me), "peer directory must include this node");
        let majority = peers.len() / 2 + 1;

        let mut inner = RaftInner {
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            log: LogStore::new(),
            snapshot: storage.read_snapshot(),
            commit_index: 0,
            last_applied: 0,
            votes: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
        };

        if let Some(state) = PersistedState::decode(&storage.read_state()) {
            inner.current_term = state.current_term;
            inner.voted_for = state.voted_for;
            inner.log = LogStore::restore(state.offset, state.last_log_index, state.logs);
            // Entries at or below the offset were applied through the
            // snapshot the upstream recovers on its own.
            inner.commit_index = state.offset;
            inner.last_applied = state.offset;
            log::info!(
                "[{}] restored term {} offset {} last {}",
                me,
                inner.current_term,
                inner.log.offset(),
                inner.log.last_index()
            );
        }

        let replicate_notify = peers
            .iter()
            .filter(|&&p| p != me)
            .map(|&p| (p, Arc::new(Notify::new())))
            .collect();

        let raft = Arc::new(Raft {
            me,
            peers,
            majority,
            inner: Mutex::new(inner),
            timer: Mutex::new(ElectionTimer::new()),
            dead: AtomicBool::new(false),
            storage,
            transport,
            apply_tx,
            apply_notify: Notify::new(),
            replicate_notify,
        });

        tokio::spawn(raft.clone().ticker());
        tokio::spawn(raft.clone().applier());
        for (&peer, notify) in &raft.replicate_notify {
            tokio::spawn(raft.clone().replicator(peer, notify.clone()));
        }
        raft
    }

    /// Current term and whether this node believes it is the leader.
    pub fn get_state(&self) -> (u64, bool) {
        let inner = self.inner.lock().unwrap();
        (inner.current_term, inner.role == Role::Leader)
    }

    /// Ask the leader to start agreement on a command. Returns the index the
    /// command will occupy if it commits, the current term, and whether this
    /// node accepted it as leader.
    pub fn start(self: &Arc<Self>, command: Vec<u8>) -> (u64, u64, bool) {
        let mut inner = self.inner.lock().unwrap();
        let term = inner.current_term;
        if inner.role != Role::Leader || self.killed() {
            return (0, term, false);
        }

        inner.log.append_one(LogEntry { term, command });
        let index = inner.log.last_index();
        self.persist(&inner);
        log::debug!("[{}] term {} start index {}", self.me, term, index);
        drop(inner);

        // Hang on a moment before waking the workers; one wakeup covers a
        // burst of Start calls.
        let rf = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(3)).await;
            rf.wake_replicators();
        });

        (index, term, true)
    }

    pub fn kill(&self) {
        log::info!("[{}] killed", self.me);
        self.dead.store(true, Ordering::SeqCst);
        self.apply_notify.notify_one();
        self.wake_replicators();
    }

    pub fn killed(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    pub(crate) fn wake_replicators(&self) {
        for notify in self.replicate_notify.values() {
            notify.notify_one();
        }
    }

    /// Persist term, vote, and log. Must complete before any reply that
    /// depends on the mutation leaves this node.
    pub(crate) fn persist(&self, inner: &RaftInner) {
        let state = Self::encode_state(inner);
        self.storage
            .save_state(&state)
            .expect("raft state persistence failed");
    }

    pub(crate) fn encode_state(inner: &RaftInner) -> Vec<u8> {
        PersistedState {
            current_term: inner.current_term,
            voted_for: inner.voted_for,
            offset: inner.log.offset(),
            last_log_index: inner.log.last_index(),
            logs: inner.log.as_slice().to_vec(),
        }
        .encode()
    }

    /// Step down into `term`, clearing the vote. Persists.
    pub(crate) fn to_higher_term(&self, inner: &mut RaftInner, term: u64) {
        log::info!(
            "[{}] term {} -> {}, back to follower",
            self.me,
            inner.current_term,
            term
        );
        inner.role = Role::Follower;
        inner.votes = 0;
        inner.current_term = term;
        inner.voted_for = None;
        self.persist(inner);
    }

    /// Ticker: starts an election whenever the randomized deadline passes
    /// while this node is not the leader.
    async fn ticker(self: Arc<Self>) {
        while !self.killed() {
            let deadline = self.timer.lock().unwrap().deadline;
            if Instant::now() >= deadline {
                let is_leader = self.inner.lock().unwrap().role == Role::Leader;
                self.timer.lock().unwrap().fresh();
                if !is_leader {
                    self.new_election();
                }
            }
            let deadline = self.timer.lock().unwrap().deadline;
            let nap = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(nap.max(Duration::from_millis(10))).await;
        }
    }

    /// Applier: drains `(last_applied, commit_index]` under the lock, then
    /// emits the batch with the lock released. Emitting under the lock could
    /// deadlock against an upstream that calls back into Raft.
    async fn applier(self: Arc<Self>) {
        loop {
            if self.killed() {
                return;
            }

            let batch: Vec<ApplyMsg> = {
                let mut inner = self.inner.lock().unwrap();
                if inner.last_applied < inner.commit_index {
                    let (from, to) = (inner.last_applied + 1, inner.commit_index);
                    let msgs = (from..=to)
                        .map(|index| ApplyMsg::Command {
                            index,
                            command: inner.log.command_at(index).to_vec(),
                        })
                        .collect();
                    log::debug!("[{}] apply [{}..={}]", self.me, from, to);
                    inner.last_applied = to;
                    msgs
                } else {
                    Vec::new()
                }
            };

            if batch.is_empty() {
                self.apply_notify.notified().await;
                continue;
            }
            for msg in batch {
                if self.apply_tx.send(msg).await.is_err() {
                    // Upstream dropped its receiver; nothing left to feed.
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::testutil::disconnected_raft;

    #[tokio::test]
    async fn start_rejects_on_follower() {
        let (raft, _rx, _storage) = disconnected_raft(vec![0, 1, 2], 0);
        let (index, _term, is_leader) = raft.start(b"cmd".to_vec());
        assert_eq!(index, 0);
        assert!(!is_leader);
    }

    #[tokio::test]
    async fn start_rejects_after_kill() {
        let (raft, _rx, _storage) = disconnected_raft(vec![0, 1, 2], 0);
        {
            let mut inner = raft.inner.lock().unwrap();
            inner.role = Role::Leader;
        }
        raft.kill();
        let (_, _, is_leader) = raft.start(b"cmd".to_vec());
        assert!(!is_leader);
    }

    #[tokio::test]
    async fn leader_appends_and_reports_index() {
        let (raft, _rx, _storage) = disconnected_raft(vec![0, 1, 2], 0);
        {
            let mut inner = raft.inner.lock().unwrap();
            inner.role = Role::Leader;
            inner.current_term = 3;
        }
        let (index, term, is_leader) = raft.start(b"x".to_vec());
        assert!(is_leader);
        assert_eq!((index, term), (1, 3));
        let (index, _, _) = raft.start(b"y".to_vec());
        assert_eq!(index, 2);
        raft.kill();
    }

    #[tokio::test]
    async fn restart_restores_term_and_log() {
        let (raft, _rx, storage) = disconnected_raft(vec![0, 1, 2], 0);
        {
            let mut inner = raft.inner.lock().unwrap();
            inner.role = Role::Leader;
            inner.current_term = 5;
        }
        raft.start(b"a".to_vec());
        raft.start(b"b".to_vec());
        raft.kill();

        let (tx, _rx2) = mpsc::channel(8);
        let restarted = Raft::new(
            vec![0, 1, 2],
            0,
            storage,
            Arc::new(crate::raft::testutil::NoopTransport),
            tx,
        );
        let inner = restarted.inner.lock().unwrap();
        assert_eq!(inner.current_term, 5);
        assert_eq!(inner.log.last_index(), 2);
        assert_eq!(inner.log.command_at(2), b"b");
        assert_eq!(inner.role, Role::Follower);
        drop(inner);
        restarted.kill();
    }
}
