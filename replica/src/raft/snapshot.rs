//! Snapshot handling: service-initiated trims, the InstallSnapshot receiver,
//! and the conditional install gate.
//!
//! A leader-sent snapshot is not installed from the RPC handler. The handler
//! forwards it to the upstream over the apply channel; only when the upstream
//! calls back into `cond_install_snapshot` does the state trim happen. The
//! gate keeps the applied index strictly monotonic against command applies
//! already in flight.

use std::sync::Arc;

use super::node::{Raft, RaftInner};
use super::{ApplyMsg, InstallSnapshotArgs, InstallSnapshotReply, Role};

impl Raft {
    /// The upstream has captured its state through `index` and no longer
    /// needs the log below it. Trims the log and persists state and snapshot
    /// as a pair.
    pub fn snapshot(&self, index: u64, snapshot: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        if index <= inner.log.offset() || index > inner.last_applied {
            log::warn!(
                "[{}] ignoring snapshot at {} (offset {}, applied {})",
                self.me,
                index,
                inner.log.offset(),
                inner.last_applied
            );
            return;
        }
        let term = inner.log.term_at(index);
        self.install_snapshot_state(&mut inner, index, term, snapshot);
    }

    /// InstallSnapshot handler. Replies with the current term; the actual
    /// install waits for the upstream's `cond_install_snapshot`.
    pub fn handle_install_snapshot(
        self: &Arc<Self>,
        args: InstallSnapshotArgs,
    ) -> InstallSnapshotReply {
        let mut inner = self.inner.lock().unwrap();
        if args.term < inner.current_term {
            return InstallSnapshotReply {
                term: inner.current_term,
            };
        }
        if args.term > inner.current_term {
            self.to_higher_term(&mut inner, args.term);
        }
        inner.role = Role::Follower;
        self.timer.lock().unwrap().fresh();
        let term = inner.current_term;

        if inner.last_applied >= args.last_included_index {
            // Already past this boundary; the leader will learn our progress
            // from the next append round.
            return InstallSnapshotReply { term };
        }
        log::info!(
            "[{}] term {} forwarding snapshot at {} upstream",
            self.me,
            term,
            args.last_included_index
        );
        drop(inner);

        // Emitting on the apply channel can block; never do it under the
        // lock or from the handler itself.
        let rf = self.clone();
        tokio::spawn(async move {
            if rf.killed() {
                return;
            }
            let msg = ApplyMsg::Snapshot {
                index: args.last_included_index,
                term: args.last_included_term,
                data: args.snapshot,
            };
            let _ = rf.apply_tx.send(msg).await;
        });
        InstallSnapshotReply { term }
    }

    /// The upstream is willing to adopt a snapshot it received over the apply
    /// channel. Returns false when Raft has applied past the boundary in the
    /// meantime; true after the trim and paired persist took effect.
    pub fn cond_install_snapshot(&self, last_term: u64, last_index: u64, snapshot: Vec<u8>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.last_applied >= last_index {
            log::debug!(
                "[{}] rejecting snapshot install at {} (applied {})",
                self.me,
                last_index,
                inner.last_applied
            );
            return false;
        }
        self.install_snapshot_state(&mut inner, last_index, last_term, snapshot);
        true
    }

    /// Trim the log so slot 0 sits at `index` with `term`, advance the commit
    /// and apply cursors, and persist state + snapshot atomically.
    fn install_snapshot_state(
        &self,
        inner: &mut RaftInner,
        index: u64,
        term: u64,
        snapshot: Vec<u8>,
    ) {
        log::info!(
            "[{}] term {} snapshot install, offset {} -> {}",
            self.me,
            inner.current_term,
            inner.log.offset(),
            index
        );
        if index > inner.commit_index {
            inner.commit_index = index;
        }
        if index > inner.last_applied {
            inner.last_applied = index;
        }
        inner.log.trim_head(index, term);
        inner.snapshot = snapshot;

        let state = Self::encode_state(inner);
        self.storage
            .save_state_and_snapshot(&state, &inner.snapshot)
            .expect("raft snapshot persistence failed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::super::node::Raft;
    use super::super::storage::Storage;
    use super::super::testutil::{disconnected_raft, NoopTransport};
    use super::super::{ApplyMsg, InstallSnapshotArgs, LogEntry};

    /// Feed a follower five committed entries through the append handler and
    /// wait until they are applied.
    async fn warmed_follower() -> (
        Arc<Raft>,
        mpsc::Receiver<ApplyMsg>,
        Arc<super::super::storage::MemStorage>,
    ) {
        let (raft, mut rx, storage) = disconnected_raft(vec![0, 1, 2], 0);
        let entries = (1..=5u64)
            .map(|i| LogEntry {
                term: 1,
                command: vec![i as u8],
            })
            .collect();
        raft.handle_append_entries(super::super::AppendEntriesArgs {
            term: 1,
            leader_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries,
            leader_commit: 5,
        });
        for _ in 0..5 {
            rx.recv().await.unwrap();
        }
        (raft, rx, storage)
    }

    #[tokio::test]
    async fn service_snapshot_trims_and_persists_pair() {
        let (raft, _rx, storage) = warmed_follower().await;
        raft.snapshot(3, b"through-3".to_vec());
        {
            let inner = raft.inner.lock().unwrap();
            assert_eq!(inner.log.offset(), 3);
            assert_eq!(inner.log.last_index(), 5);
            assert_eq!(inner.commit_index, 5);
        }
        assert_eq!(storage.read_snapshot(), b"through-3");
        raft.kill();
    }

    #[tokio::test]
    async fn snapshot_guards_reject_stale_and_unapplied_indices() {
        let (raft, _rx, storage) = warmed_follower().await;
        raft.snapshot(3, b"ok".to_vec());
        // At or below the offset: no effect.
        raft.snapshot(3, b"stale".to_vec());
        // Beyond last_applied: no effect.
        raft.snapshot(9, b"future".to_vec());
        assert_eq!(raft.inner.lock().unwrap().log.offset(), 3);
        assert_eq!(storage.read_snapshot(), b"ok");
        raft.kill();
    }

    #[tokio::test]
    async fn snapshot_survives_restart() {
        let (raft, _rx, storage) = warmed_follower().await;
        raft.snapshot(4, b"state-4".to_vec());
        raft.kill();

        let (tx, _rx2) = mpsc::channel(8);
        let restarted = Raft::new(
            vec![0, 1, 2],
            0,
            storage.clone() as Arc<dyn Storage>,
            Arc::new(NoopTransport),
            tx,
        );
        let inner = restarted.inner.lock().unwrap();
        assert_eq!(inner.log.offset(), 4);
        assert_eq!(inner.log.last_index(), 5);
        assert_eq!(inner.log.term_at(4), 1);
        assert_eq!(inner.commit_index, 4);
        assert_eq!(inner.last_applied, 4);
        assert_eq!(inner.snapshot, b"state-4");
        drop(inner);
        restarted.kill();
    }

    #[tokio::test]
    async fn install_snapshot_forwards_upstream_and_gates_install() {
        let (raft, mut rx, _s) = disconnected_raft(vec![0, 1, 2], 0);
        let reply = raft.handle_install_snapshot(InstallSnapshotArgs {
            term: 2,
            last_included_index: 8,
            last_included_term: 2,
            snapshot: b"far-ahead".to_vec(),
        });
        assert_eq!(reply.term, 2);

        match rx.recv().await.unwrap() {
            ApplyMsg::Snapshot { index, term, data } => {
                assert_eq!((index, term), (8, 2));
                assert!(raft.cond_install_snapshot(term, index, data));
            }
            other => panic!("unexpected apply {:?}", other),
        }
        let inner = raft.inner.lock().unwrap();
        assert_eq!(inner.log.offset(), 8);
        assert_eq!(inner.last_applied, 8);
        assert_eq!(inner.log.term_at(8), 2);
        drop(inner);
        raft.kill();
    }

    #[tokio::test]
    async fn stale_install_snapshot_takes_no_state_action() {
        let (raft, _rx, _s) = warmed_follower().await;
        let offset_before = raft.inner.lock().unwrap().log.offset();
        let reply = raft.handle_install_snapshot(InstallSnapshotArgs {
            term: 1,
            last_included_index: 2,
            last_included_term: 1,
            snapshot: b"old".to_vec(),
        });
        assert_eq!(reply.term, 1);
        assert_eq!(raft.inner.lock().unwrap().log.offset(), offset_before);
        raft.kill();
    }

    #[tokio::test]
    async fn cond_install_rejects_once_applied_past_boundary() {
        let (raft, _rx, _s) = warmed_follower().await;
        assert!(!raft.cond_install_snapshot(1, 4, b"late".to_vec()));
        assert!(raft.cond_install_snapshot(1, 9, b"ahead".to_vec()));
        assert_eq!(raft.inner.lock().unwrap().log.offset(), 9);
        raft.kill();
    }
}
