//! Raft service implementation
//!
//! This module implements the gRPC service for Raft communication between
//! nodes, translating between the wire messages and the core types.

use std::sync::Arc;
use std::time::Instant;

use crate::metrics;
use crate::raft::node::Raft;
use crate::raft::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, LogEntry, RequestVoteArgs,
};
use pb::raft_service_server::RaftService;

/// Protocol buffer definitions for the Raft service
pub mod pb {
    tonic::include_proto!("raft");
}

impl From<pb::Entry> for LogEntry {
    fn from(e: pb::Entry) -> Self {
        LogEntry {
            term: e.term,
            command: e.command,
        }
    }
}

impl From<LogEntry> for pb::Entry {
    fn from(e: LogEntry) -> Self {
        pb::Entry {
            term: e.term,
            command: e.command,
        }
    }
}

impl From<pb::AppendEntriesRequest> for AppendEntriesArgs {
    fn from(req: pb::AppendEntriesRequest) -> Self {
        AppendEntriesArgs {
            term: req.term,
            leader_id: req.leader_id,
            prev_log_index: req.prev_log_index,
            prev_log_term: req.prev_log_term,
            entries: req.entries.into_iter().map(Into::into).collect(),
            leader_commit: req.leader_commit,
        }
    }
}

impl From<AppendEntriesArgs> for pb::AppendEntriesRequest {
    fn from(args: AppendEntriesArgs) -> Self {
        pb::AppendEntriesRequest {
            term: args.term,
            leader_id: args.leader_id,
            prev_log_index: args.prev_log_index,
            prev_log_term: args.prev_log_term,
            entries: args.entries.into_iter().map(Into::into).collect(),
            leader_commit: args.leader_commit,
        }
    }
}

impl From<pb::AppendEntriesResponse> for AppendEntriesReply {
    fn from(resp: pb::AppendEntriesResponse) -> Self {
        AppendEntriesReply {
            term: resp.term,
            success: resp.success,
            rejected_by_term: resp.rejected_by_term,
            next_index: resp.next_index,
            x_term: resp.x_term,
            x_index: resp.x_index,
            x_len: resp.x_len,
        }
    }
}

/// Raft service implementation
pub struct RaftServiceSVC {
    raft: Arc<Raft>,
}

impl RaftServiceSVC {
    pub fn new(raft: Arc<Raft>) -> Self {
        RaftServiceSVC { raft }
    }
}

#[tonic::async_trait]
impl RaftService for RaftServiceSVC {
    async fn request_vote(
        &self,
        request: tonic::Request<pb::RequestVoteRequest>,
    ) -> Result<tonic::Response<pb::RequestVoteResponse>, tonic::Status> {
        let started = Instant::now();
        let req = request.into_inner();
        let reply = self.raft.handle_request_vote(RequestVoteArgs {
            term: req.term,
            candidate_id: req.candidate_id,
            last_log_index: req.last_log_index,
            last_log_term: req.last_log_term,
        });
        let outcome = if reply.vote_granted { "granted" } else { "denied" };
        metrics::observe_rpc("request_vote", outcome, started);
        Ok(tonic::Response::new(pb::RequestVoteResponse {
            term: reply.term,
            vote_granted: reply.vote_granted,
        }))
    }

    async fn append_entries(
        &self,
        request: tonic::Request<pb::AppendEntriesRequest>,
    ) -> Result<tonic::Response<pb::AppendEntriesResponse>, tonic::Status> {
        let started = Instant::now();
        let reply = self.raft.handle_append_entries(request.into_inner().into());
        let outcome = if reply.rejected_by_term {
            "stale"
        } else if reply.success {
            "ok"
        } else {
            "conflict"
        };
        metrics::observe_rpc("append_entries", outcome, started);
        Ok(tonic::Response::new(pb::AppendEntriesResponse {
            term: reply.term,
            success: reply.success,
            rejected_by_term: reply.rejected_by_term,
            next_index: reply.next_index,
            x_term: reply.x_term,
            x_index: reply.x_index,
            x_len: reply.x_len,
        }))
    }

    async fn install_snapshot(
        &self,
        request: tonic::Request<pb::InstallSnapshotRequest>,
    ) -> Result<tonic::Response<pb::InstallSnapshotResponse>, tonic::Status> {
        let started = Instant::now();
        let req = request.into_inner();
        let sender_term = req.term;
        let reply = self.raft.handle_install_snapshot(InstallSnapshotArgs {
            term: req.term,
            last_included_index: req.last_included_index,
            last_included_term: req.last_included_term,
            snapshot: req.snapshot,
        });
        let outcome = if reply.term > sender_term { "stale" } else { "accepted" };
        metrics::observe_rpc("install_snapshot", outcome, started);
        Ok(tonic::Response::new(pb::InstallSnapshotResponse {
            term: reply.term,
        }))
    }
}
