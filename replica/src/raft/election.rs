//! Leader election: candidacy, vote collection, and the RequestVote handler.

use std::sync::Arc;

use super::node::{Raft, RaftInner};
use super::{RequestVoteArgs, RequestVoteReply, Role};

/// A candidate's log is electable iff it is at least as up-to-date as ours:
/// higher last term wins, equal last term falls back to last index.
fn new_enough(self_term: u64, other_term: u64, self_index: u64, other_index: u64) -> bool {
    if other_term != self_term {
        other_term > self_term
    } else {
        other_index >= self_index
    }
}

impl Raft {
    /// Open a new candidacy: bump the term, vote for self, persist, and fan
    /// the vote requests out. Called from the ticker after the deadline was
    /// refreshed.
    pub(crate) fn new_election(self: &Arc<Self>) {
        let args = {
            let mut inner = self.inner.lock().unwrap();
            inner.role = Role::Candidate;
            inner.current_term += 1;
            inner.voted_for = Some(self.me);
            inner.votes = 1;
            self.persist(&inner);
            log::info!(
                "[{}] term {} starting election",
                self.me,
                inner.current_term
            );
            RequestVoteArgs {
                term: inner.current_term,
                candidate_id: self.me,
                last_log_index: inner.log.last_index(),
                last_log_term: inner.log.last_term(),
            }
        };

        for &peer in self.peers.iter().filter(|&&p| p != self.me) {
            let rf = self.clone();
            let args = args.clone();
            tokio::spawn(async move {
                let term = args.term;
                match rf.transport.request_vote(peer, args).await {
                    Ok(reply) => rf.on_vote_reply(term, reply),
                    Err(e) => log::debug!("[{}] vote rpc to {} failed: {}", rf.me, peer, e),
                }
            });
        }
    }

    /// Count a vote reply. Replies from an older candidacy, or arriving after
    /// this node stopped being a candidate, are dropped.
    fn on_vote_reply(self: &Arc<Self>, issued_term: u64, reply: RequestVoteReply) {
        let mut inner = self.inner.lock().unwrap();
        if self.killed() {
            return;
        }
        if reply.term > inner.current_term {
            self.to_higher_term(&mut inner, reply.term);
            return;
        }
        if inner.current_term != issued_term || inner.role != Role::Candidate {
            return;
        }
        if reply.vote_granted {
            inner.votes += 1;
            if inner.votes >= self.majority {
                self.become_leader(&mut inner);
            }
        }
    }

    /// Reinitialize per-follower progress and wake the replication workers so
    /// an immediate heartbeat establishes authority.
    fn become_leader(&self, inner: &mut RaftInner) {
        log::info!(
            "[{}] term {} won election with {} votes",
            self.me,
            inner.current_term,
            inner.votes
        );
        inner.role = Role::Leader;
        let next = inner.log.last_index() + 1;
        for &peer in &self.peers {
            inner.next_index.insert(peer, next);
            inner.match_index.insert(peer, 0);
        }
        self.wake_replicators();
    }

    /// RequestVote handler.
    pub fn handle_request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        let mut inner = self.inner.lock().unwrap();

        if args.term < inner.current_term {
            return RequestVoteReply {
                term: inner.current_term,
                vote_granted: false,
            };
        }
        if args.term > inner.current_term {
            self.to_higher_term(&mut inner, args.term);
        }
        // A leader in the same term never grants; two leaders in one term is
        // exactly what the vote rule exists to prevent.
        if inner.role == Role::Leader {
            return RequestVoteReply {
                term: inner.current_term,
                vote_granted: false,
            };
        }

        let self_index = inner.log.last_index();
        let self_term = inner.log.last_term();
        let grant = inner.voted_for == Some(args.candidate_id)
            || (inner.voted_for.is_none()
                && new_enough(self_term, args.last_log_term, self_index, args.last_log_index));

        if grant {
            inner.voted_for = Some(args.candidate_id);
            self.persist(&inner);
            self.timer.lock().unwrap().fresh();
            log::info!(
                "[{}] term {} vote granted to {}",
                self.me,
                inner.current_term,
                args.candidate_id
            );
        } else {
            log::debug!(
                "[{}] term {} vote denied to {} (voted_for {:?}, log [t{} i{}] vs [t{} i{}])",
                self.me,
                inner.current_term,
                args.candidate_id,
                inner.voted_for,
                self_term,
                self_index,
                args.last_log_term,
                args.last_log_index
            );
        }
        RequestVoteReply {
            term: inner.current_term,
            vote_granted: grant,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::testutil::disconnected_raft;
    use crate::raft::LogEntry;

    fn vote_args(term: u64, candidate: u64, last_index: u64, last_term: u64) -> RequestVoteArgs {
        RequestVoteArgs {
            term,
            candidate_id: candidate,
            last_log_index: last_index,
            last_log_term: last_term,
        }
    }

    #[tokio::test]
    async fn grants_first_vote_and_advances_term() {
        let (raft, _rx, _s) = disconnected_raft(vec![0, 1, 2], 0);
        let reply = raft.handle_request_vote(vote_args(2, 1, 0, 0));
        assert!(reply.vote_granted);
        assert_eq!(reply.term, 2);
        assert_eq!(raft.inner.lock().unwrap().voted_for, Some(1));
        raft.kill();
    }

    #[tokio::test]
    async fn repeated_vote_from_same_candidate_is_idempotent() {
        let (raft, _rx, _s) = disconnected_raft(vec![0, 1, 2], 0);
        let first = raft.handle_request_vote(vote_args(2, 1, 0, 0));
        let second = raft.handle_request_vote(vote_args(2, 1, 0, 0));
        assert!(first.vote_granted && second.vote_granted);
        assert_eq!(first.term, second.term);
        assert_eq!(raft.inner.lock().unwrap().voted_for, Some(1));
        raft.kill();
    }

    #[tokio::test]
    async fn denies_second_candidate_in_same_term() {
        let (raft, _rx, _s) = disconnected_raft(vec![0, 1, 2], 0);
        assert!(raft.handle_request_vote(vote_args(2, 1, 0, 0)).vote_granted);
        assert!(!raft.handle_request_vote(vote_args(2, 2, 0, 0)).vote_granted);
        raft.kill();
    }

    #[tokio::test]
    async fn denies_stale_term() {
        let (raft, _rx, _s) = disconnected_raft(vec![0, 1, 2], 0);
        raft.inner.lock().unwrap().current_term = 5;
        let reply = raft.handle_request_vote(vote_args(3, 1, 9, 3));
        assert!(!reply.vote_granted);
        assert_eq!(reply.term, 5);
        raft.kill();
    }

    #[tokio::test]
    async fn denies_candidate_with_outdated_log() {
        let (raft, _rx, _s) = disconnected_raft(vec![0, 1, 2], 0);
        {
            let mut inner = raft.inner.lock().unwrap();
            inner.current_term = 3;
            inner.log.append_many(vec![
                LogEntry {
                    term: 1,
                    command: vec![1],
                },
                LogEntry {
                    term: 3,
                    command: vec![2],
                },
            ]);
        }
        // Same last term, shorter log.
        assert!(!raft.handle_request_vote(vote_args(4, 1, 1, 3)).vote_granted);
        // Lower last term, longer log.
        assert!(!raft.handle_request_vote(vote_args(5, 1, 9, 2)).vote_granted);
        // At least as up-to-date.
        assert!(raft.handle_request_vote(vote_args(6, 1, 2, 3)).vote_granted);
        raft.kill();
    }

    #[tokio::test]
    async fn leader_denies_vote_in_equal_term() {
        let (raft, _rx, _s) = disconnected_raft(vec![0, 1, 2], 0);
        {
            let mut inner = raft.inner.lock().unwrap();
            inner.current_term = 4;
            inner.role = Role::Leader;
        }
        let reply = raft.handle_request_vote(vote_args(4, 1, 10, 4));
        assert!(!reply.vote_granted);
        // A higher term still dethrones.
        let reply = raft.handle_request_vote(vote_args(5, 1, 10, 4));
        assert!(reply.vote_granted);
        assert_eq!(raft.inner.lock().unwrap().role, Role::Follower);
        raft.kill();
    }
}
