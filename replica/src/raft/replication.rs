//! Log replication: per-follower workers, the AppendEntries receiver, fast
//! rollback, and the majority commit computation.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::time::timeout;

use super::node::{Raft, RaftInner};
use super::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, Role, HEARTBEAT_INTERVAL,
};

enum Dispatch {
    Append(AppendEntriesArgs),
    Snapshot(InstallSnapshotArgs),
    None,
}

impl Raft {
    /// One worker per follower. Runs an RPC round whenever this node leads,
    /// then waits for either a wakeup (new entries, fresh leadership) or the
    /// heartbeat tick. A round reporting more pending work loops immediately.
    pub(crate) async fn replicator(self: Arc<Self>, peer: u64, notify: Arc<Notify>) {
        while !self.killed() {
            let is_leader = self.inner.lock().unwrap().role == Role::Leader;
            let again = if is_leader {
                self.replicate_once(peer).await
            } else {
                false
            };
            if !again {
                let _ = timeout(HEARTBEAT_INTERVAL, notify.notified()).await;
            }
        }
    }

    /// Run one replication RPC against `peer`. Returns true when the worker
    /// should go again without waiting (follower still behind, or a rollback
    /// moved `next_index`).
    async fn replicate_once(&self, peer: u64) -> bool {
        let dispatch = {
            let inner = self.inner.lock().unwrap();
            if inner.role != Role::Leader {
                Dispatch::None
            } else {
                let next = inner.next_index[&peer];
                if next <= inner.log.offset() {
                    // Too far behind for log entries; ship the snapshot.
                    Dispatch::Snapshot(InstallSnapshotArgs {
                        term: inner.current_term,
                        last_included_index: inner.log.offset(),
                        last_included_term: inner.log.term_at(inner.log.offset()),
                        snapshot: inner.snapshot.clone(),
                    })
                } else {
                    let prev = next - 1;
                    Dispatch::Append(AppendEntriesArgs {
                        term: inner.current_term,
                        leader_id: self.me,
                        prev_log_index: prev,
                        prev_log_term: inner.log.term_at(prev),
                        entries: inner.log.tail_from(next),
                        leader_commit: inner.commit_index,
                    })
                }
            }
        };

        match dispatch {
            Dispatch::None => false,
            Dispatch::Append(args) => {
                let issued_term = args.term;
                match self.transport.append_entries(peer, args).await {
                    Ok(reply) => self.on_append_reply(peer, issued_term, reply),
                    Err(e) => {
                        log::debug!("[{}] append rpc to {} failed: {}", self.me, peer, e);
                        false
                    }
                }
            }
            Dispatch::Snapshot(args) => {
                let issued_term = args.term;
                let sent_index = args.last_included_index;
                match self.transport.install_snapshot(peer, args).await {
                    Ok(reply) => {
                        let mut inner = self.inner.lock().unwrap();
                        if reply.term > inner.current_term {
                            self.to_higher_term(&mut inner, reply.term);
                            return false;
                        }
                        if inner.role != Role::Leader || inner.current_term != issued_term {
                            return false;
                        }
                        let matched = inner.match_index[&peer].max(sent_index);
                        inner.match_index.insert(peer, matched);
                        inner.next_index.insert(peer, sent_index + 1);
                        // Follow up with the log tail right away.
                        true
                    }
                    Err(e) => {
                        log::debug!("[{}] snapshot rpc to {} failed: {}", self.me, peer, e);
                        false
                    }
                }
            }
        }
    }

    /// Digest an AppendEntries reply. Replies issued in an older term, or
    /// arriving after leadership was lost, are dropped.
    fn on_append_reply(&self, peer: u64, issued_term: u64, reply: AppendEntriesReply) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if self.killed() {
            return false;
        }
        if reply.term > inner.current_term {
            self.to_higher_term(&mut inner, reply.term);
            return false;
        }
        if inner.role != Role::Leader || inner.current_term != issued_term {
            return false;
        }
        if reply.rejected_by_term {
            // The follower knew a higher term than ours at issue time; if it
            // still matters, the reply.term check above already handled it.
            return false;
        }

        if reply.success {
            let matched = inner.match_index[&peer].max(reply.next_index - 1);
            inner.match_index.insert(peer, matched);
            inner.next_index.insert(peer, reply.next_index);
            self.maybe_commit(&mut inner);
            return inner.next_index[&peer] <= inner.log.last_index();
        }

        // Fast rollback: one RPC per conflicting term instead of one per
        // entry.
        let next = if reply.x_term == -1 {
            // Follower's log is shorter than prev_log_index.
            reply.x_len
        } else if let Some(last) = inner.log.last_index_of_term(reply.x_term as u64) {
            last + 1
        } else {
            reply.x_index
        };
        log::debug!(
            "[{}] term {} rollback next_index[{}] -> {}",
            self.me,
            inner.current_term,
            peer,
            next
        );
        inner.next_index.insert(peer, next.max(1));
        true
    }

    /// Advance `commit_index` to the highest N replicated on a majority whose
    /// entry is from the current term. Counting replicas of an older term's
    /// entry would re-commit overwritten history.
    fn maybe_commit(&self, inner: &mut RaftInner) {
        let last = inner.log.last_index();
        let mut n = last;
        while n > inner.commit_index {
            if inner.log.term_at(n) != inner.current_term {
                // Terms only decrease further down; nothing below commits
                // by counting either.
                break;
            }
            let replicas = 1 + self
                .peers
                .iter()
                .filter(|&&p| p != self.me && inner.match_index[&p] >= n)
                .count();
            if replicas >= self.majority {
                log::debug!(
                    "[{}] term {} commit [{}..={}]",
                    self.me,
                    inner.current_term,
                    inner.commit_index + 1,
                    n
                );
                inner.commit_index = n;
                self.apply_notify.notify_one();
                break;
            }
            n -= 1;
        }
    }

    /// AppendEntries handler.
    pub fn handle_append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesReply {
        let mut inner = self.inner.lock().unwrap();
        let mut reply = AppendEntriesReply::default();

        if args.term < inner.current_term {
            reply.term = inner.current_term;
            reply.rejected_by_term = true;
            return reply;
        }
        if args.term > inner.current_term {
            self.to_higher_term(&mut inner, args.term);
        } else {
            inner.role = Role::Follower;
        }
        self.timer.lock().unwrap().fresh();
        reply.term = inner.current_term;

        let sent_last = args.prev_log_index + args.entries.len() as u64;
        reply.next_index = sent_last + 1;

        // Log too short to contain the probe point.
        if args.prev_log_index > inner.log.last_index() {
            reply.x_term = -1;
            reply.x_len = inner.log.last_index() + 1;
            return reply;
        }

        // Probe point exists but carries a conflicting term.
        if args.prev_log_index > inner.log.offset()
            && inner.log.term_at(args.prev_log_index) != args.prev_log_term
        {
            reply.x_term = inner.log.term_at(args.prev_log_index) as i64;
            reply.x_index = inner.log.first_index_of_term(args.prev_log_index);
            reply.x_len = inner.log.last_index() + 1;
            log::debug!(
                "[{}] term {} conflict at {}: x_term {} x_index {}",
                self.me,
                inner.current_term,
                args.prev_log_index,
                reply.x_term,
                reply.x_index
            );
            return reply;
        }

        // Prefix matched.
        reply.success = true;
        if sent_last <= inner.last_applied {
            // Entire window already applied; a duplicate of an old RPC.
            return reply;
        }

        // Scan the overlap; the first term mismatch truncates the tail. A
        // follower log that is a matching superset keeps its extra entries:
        // they may be committed beyond this (possibly reordered) send window.
        let scan_end = inner.log.last_index().min(sent_last);
        let mut scan = (args.prev_log_index + 1).max(inner.log.offset() + 1);
        while scan <= scan_end {
            let incoming = &args.entries[(scan - args.prev_log_index - 1) as usize];
            if inner.log.term_at(scan) != incoming.term {
                inner.log.truncate_tail(scan);
                break;
            }
            scan += 1;
        }
        if scan <= sent_last {
            let fresh = args.entries[(scan - args.prev_log_index - 1) as usize..].to_vec();
            inner.log.append_many(fresh);
            self.persist(&inner);
        }

        let to_commit = args.leader_commit.min(inner.log.last_index());
        if to_commit > inner.commit_index {
            log::debug!(
                "[{}] term {} commit [{}..={}]",
                self.me,
                inner.current_term,
                inner.commit_index + 1,
                to_commit
            );
            inner.commit_index = to_commit;
            if inner.commit_index > inner.last_applied {
                self.apply_notify.notify_one();
            }
        }
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::testutil::disconnected_raft;
    use crate::raft::{ApplyMsg, LogEntry};

    fn entries(terms: &[u64]) -> Vec<LogEntry> {
        terms
            .iter()
            .map(|&term| LogEntry {
                term,
                command: vec![term as u8],
            })
            .collect()
    }

    fn append_args(
        term: u64,
        prev_index: u64,
        prev_term: u64,
        terms: &[u64],
        commit: u64,
    ) -> AppendEntriesArgs {
        AppendEntriesArgs {
            term,
            leader_id: 1,
            prev_log_index: prev_index,
            prev_log_term: prev_term,
            entries: entries(terms),
            leader_commit: commit,
        }
    }

    #[tokio::test]
    async fn appends_and_commits_in_order() {
        let (raft, mut rx, _s) = disconnected_raft(vec![0, 1, 2], 0);
        let reply = raft.handle_append_entries(append_args(1, 0, 0, &[1, 1, 1], 2));
        assert!(reply.success);
        assert_eq!(reply.next_index, 4);

        for expect in 1..=2u64 {
            match rx.recv().await.unwrap() {
                ApplyMsg::Command { index, .. } => assert_eq!(index, expect),
                other => panic!("unexpected apply {:?}", other),
            }
        }
        raft.kill();
    }

    #[tokio::test]
    async fn stale_term_is_rejected_by_term() {
        let (raft, _rx, _s) = disconnected_raft(vec![0, 1, 2], 0);
        raft.inner.lock().unwrap().current_term = 5;
        let reply = raft.handle_append_entries(append_args(3, 0, 0, &[3], 0));
        assert!(!reply.success);
        assert!(reply.rejected_by_term);
        assert_eq!(reply.term, 5);
        raft.kill();
    }

    #[tokio::test]
    async fn short_log_reports_x_len() {
        let (raft, _rx, _s) = disconnected_raft(vec![0, 1, 2], 0);
        raft.handle_append_entries(append_args(1, 0, 0, &[1, 1], 0));
        let reply = raft.handle_append_entries(append_args(1, 7, 1, &[1], 0));
        assert!(!reply.success);
        assert!(!reply.rejected_by_term);
        assert_eq!(reply.x_term, -1);
        assert_eq!(reply.x_len, 3);
        raft.kill();
    }

    #[tokio::test]
    async fn conflicting_term_reports_first_index_of_term() {
        let (raft, _rx, _s) = disconnected_raft(vec![0, 1, 2], 0);
        // Follower holds [t1, t2, t2]; the leader probes index 3 with t3.
        raft.handle_append_entries(append_args(2, 0, 0, &[1, 2, 2], 0));
        let reply = raft.handle_append_entries(append_args(3, 3, 3, &[3], 0));
        assert!(!reply.success);
        assert_eq!(reply.x_term, 2);
        assert_eq!(reply.x_index, 2);
        assert_eq!(reply.x_len, 4);
        raft.kill();
    }

    #[tokio::test]
    async fn duplicate_append_is_a_noop_success() {
        let (raft, mut rx, _s) = disconnected_raft(vec![0, 1, 2], 0);
        raft.handle_append_entries(append_args(1, 0, 0, &[1, 1], 2));
        for _ in 0..2 {
            rx.recv().await.unwrap();
        }
        let before = raft.inner.lock().unwrap().log.last_index();
        let reply = raft.handle_append_entries(append_args(1, 0, 0, &[1, 1], 2));
        assert!(reply.success);
        assert_eq!(reply.next_index, 3);
        assert_eq!(raft.inner.lock().unwrap().log.last_index(), before);
        raft.kill();
    }

    #[tokio::test]
    async fn matching_superset_is_not_truncated() {
        let (raft, _rx, _s) = disconnected_raft(vec![0, 1, 2], 0);
        raft.handle_append_entries(append_args(1, 0, 0, &[1, 1, 1, 1], 0));
        // A reordered, shorter window must not cut the tail.
        let reply = raft.handle_append_entries(append_args(1, 0, 0, &[1, 1], 0));
        assert!(reply.success);
        assert_eq!(raft.inner.lock().unwrap().log.last_index(), 4);
        raft.kill();
    }

    #[tokio::test]
    async fn conflicting_suffix_is_replaced() {
        let (raft, _rx, _s) = disconnected_raft(vec![0, 1, 2], 0);
        // Divergent follower: [t1, t2, t2] vs leader window [t1, t3].
        raft.handle_append_entries(append_args(2, 0, 0, &[1, 2, 2], 0));
        let reply = raft.handle_append_entries(append_args(3, 1, 1, &[3], 0));
        assert!(reply.success);
        let inner = raft.inner.lock().unwrap();
        assert_eq!(inner.log.last_index(), 2);
        assert_eq!(inner.log.term_at(2), 3);
        drop(inner);
        raft.kill();
    }

    #[tokio::test]
    async fn leader_fast_rollback_converges_in_one_reply() {
        // Scenario: leader holds [t1, t1, t1]; the follower wrote [t1, t2, t2]
        // while briefly leading term 2. One conflict reply must land
        // next_index on the first t2 entry.
        let (leader, _rx, _s) = disconnected_raft(vec![0, 1, 2], 0);
        {
            let mut inner = leader.inner.lock().unwrap();
            inner.current_term = 3;
            inner.role = Role::Leader;
            inner.log.append_many(entries(&[1, 1, 1]));
            for peer in [1, 2] {
                inner.next_index.insert(peer, 4);
                inner.match_index.insert(peer, 0);
            }
        }
        let reply = AppendEntriesReply {
            term: 3,
            success: false,
            rejected_by_term: false,
            next_index: 0,
            x_term: 2,
            x_index: 2,
            x_len: 4,
        };
        let again = leader.on_append_reply(1, 3, reply);
        assert!(again);
        // Leader has no t2 entries, so it falls back to x_index.
        assert_eq!(leader.inner.lock().unwrap().next_index[&1], 2);
        leader.kill();
    }

    #[tokio::test]
    async fn leader_rollback_skips_past_own_entries_of_x_term() {
        let (leader, _rx, _s) = disconnected_raft(vec![0, 1, 2], 0);
        {
            let mut inner = leader.inner.lock().unwrap();
            inner.current_term = 4;
            inner.role = Role::Leader;
            inner.log.append_many(entries(&[1, 2, 2, 4]));
            for peer in [1, 2] {
                inner.next_index.insert(peer, 5);
                inner.match_index.insert(peer, 0);
            }
        }
        let reply = AppendEntriesReply {
            term: 4,
            success: false,
            rejected_by_term: false,
            next_index: 0,
            x_term: 2,
            x_index: 1,
            x_len: 5,
        };
        leader.on_append_reply(1, 4, reply);
        // Leader's last t2 entry sits at index 3; next probe goes past it.
        assert_eq!(leader.inner.lock().unwrap().next_index[&1], 4);
        leader.kill();
    }

    #[tokio::test]
    async fn commit_requires_current_term_majority() {
        let (leader, mut rx, _s) = disconnected_raft(vec![0, 1, 2, 3, 4], 0);
        {
            let mut inner = leader.inner.lock().unwrap();
            inner.current_term = 2;
            inner.role = Role::Leader;
            inner.log.append_many(entries(&[1, 1, 2]));
            for peer in [1, 2, 3, 4] {
                inner.next_index.insert(peer, 4);
                inner.match_index.insert(peer, 0);
            }
        }
        // Two replicas of index 2 (an old-term entry) do not commit it.
        let ok = AppendEntriesReply {
            term: 2,
            success: true,
            next_index: 3,
            ..Default::default()
        };
        leader.on_append_reply(1, 2, ok.clone());
        leader.on_append_reply(2, 2, ok);
        assert_eq!(leader.inner.lock().unwrap().commit_index, 0);

        // Once the current-term entry reaches a majority, everything below
        // commits with it.
        let ok = AppendEntriesReply {
            term: 2,
            success: true,
            next_index: 4,
            ..Default::default()
        };
        leader.on_append_reply(1, 2, ok.clone());
        leader.on_append_reply(2, 2, ok);
        assert_eq!(leader.inner.lock().unwrap().commit_index, 3);
        for expect in 1..=3u64 {
            match rx.recv().await.unwrap() {
                ApplyMsg::Command { index, .. } => assert_eq!(index, expect),
                other => panic!("unexpected apply {:?}", other),
            }
        }
        leader.kill();
    }

    #[tokio::test]
    async fn stale_reply_from_old_term_is_dropped() {
        let (leader, _rx, _s) = disconnected_raft(vec![0, 1, 2], 0);
        {
            let mut inner = leader.inner.lock().unwrap();
            inner.current_term = 5;
            inner.role = Role::Leader;
            inner.log.append_many(entries(&[5]));
            for peer in [1, 2] {
                inner.next_index.insert(peer, 2);
                inner.match_index.insert(peer, 0);
            }
        }
        let reply = AppendEntriesReply {
            term: 4,
            success: true,
            next_index: 2,
            ..Default::default()
        };
        leader.on_append_reply(1, 4, reply);
        assert_eq!(leader.inner.lock().unwrap().match_index[&1], 0);
        leader.kill();
    }

    #[tokio::test]
    async fn higher_term_reply_steps_leader_down() {
        let (leader, _rx, _s) = disconnected_raft(vec![0, 1, 2], 0);
        {
            let mut inner = leader.inner.lock().unwrap();
            inner.current_term = 2;
            inner.role = Role::Leader;
            for peer in [1, 2] {
                inner.next_index.insert(peer, 1);
                inner.match_index.insert(peer, 0);
            }
        }
        let reply = AppendEntriesReply {
            term: 7,
            rejected_by_term: true,
            ..Default::default()
        };
        leader.on_append_reply(1, 2, reply);
        let inner = leader.inner.lock().unwrap();
        assert_eq!(inner.role, Role::Follower);
        assert_eq!(inner.current_term, 7);
        drop(inner);
        leader.kill();
    }
}
