//! Outbound gRPC transport: one lazily-connected client per peer.
//! A failed call drops the cached client so the next attempt reconnects;
//! Raft treats the failure as a lost message and retries on its own cadence.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tonic::transport::Channel;

use crate::raft::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply,
    RequestVoteArgs, RequestVoteReply,
};
use crate::raft_service::pb;
use crate::raft_service::pb::raft_service_client::RaftServiceClient;
use crate::transport::{RaftTransport, RpcError};

pub struct GrpcTransport {
    /// Peer id -> dial address, from the runtime config's node list.
    addrs: HashMap<u64, String>,
    peers: Arc<Mutex<HashMap<u64, RaftServiceClient<Channel>>>>,
}

impl GrpcTransport {
    pub fn new(addrs: HashMap<u64, String>) -> Self {
        GrpcTransport {
            addrs,
            peers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn client(&self, to: u64) -> Result<RaftServiceClient<Channel>, RpcError> {
        let mut peers = self.peers.lock().await;
        if let Some(client) = peers.get(&to) {
            return Ok(client.clone());
        }
        let addr = self
            .addrs
            .get(&to)
            .cloned()
            .ok_or(RpcError::Unreachable(to))?;
        match RaftServiceClient::connect(addr).await {
            Ok(client) => {
                peers.insert(to, client.clone());
                Ok(client)
            }
            Err(e) => {
                log::debug!("failed to connect to peer {}: {}", to, e);
                Err(RpcError::Transport(e.to_string()))
            }
        }
    }

    async fn invalidate(&self, to: u64) {
        self.peers.lock().await.remove(&to);
    }
}

#[tonic::async_trait]
impl RaftTransport for GrpcTransport {
    async fn request_vote(
        &self,
        to: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, RpcError> {
        let mut client = self.client(to).await?;
        let request = tonic::Request::new(pb::RequestVoteRequest {
            term: args.term,
            candidate_id: args.candidate_id,
            last_log_index: args.last_log_index,
            last_log_term: args.last_log_term,
        });
        match client.request_vote(request).await {
            Ok(resp) => {
                let resp = resp.into_inner();
                Ok(RequestVoteReply {
                    term: resp.term,
                    vote_granted: resp.vote_granted,
                })
            }
            Err(e) => {
                self.invalidate(to).await;
                Err(RpcError::Transport(e.to_string()))
            }
        }
    }

    async fn append_entries(
        &self,
        to: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, RpcError> {
        let mut client = self.client(to).await?;
        let request = tonic::Request::new(pb::AppendEntriesRequest::from(args));
        match client.append_entries(request).await {
            Ok(resp) => Ok(resp.into_inner().into()),
            Err(e) => {
                self.invalidate(to).await;
                Err(RpcError::Transport(e.to_string()))
            }
        }
    }

    async fn install_snapshot(
        &self,
        to: u64,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotReply, RpcError> {
        let mut client = self.client(to).await?;
        let request = tonic::Request::new(pb::InstallSnapshotRequest {
            term: args.term,
            last_included_index: args.last_included_index,
            last_included_term: args.last_included_term,
            snapshot: args.snapshot,
        });
        match client.install_snapshot(request).await {
            Ok(resp) => Ok(InstallSnapshotReply {
                term: resp.into_inner().term,
            }),
            Err(e) => {
                self.invalidate(to).await;
                Err(RpcError::Transport(e.to_string()))
            }
        }
    }
}
