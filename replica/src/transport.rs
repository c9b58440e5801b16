//! Transport seam between the Raft core and whatever delivers its RPCs.
//!
//! The core only sees [`RaftTransport`]; the binary plugs in the gRPC client
//! (`raft_client`), while tests and the benchmark use [`LocalRouter`] to wire
//! a whole cluster inside one process, including partitions and node removal.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::raft::node::Raft;
use crate::raft::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply,
    RequestVoteArgs, RequestVoteReply,
};

#[derive(Debug)]
pub enum RpcError {
    /// The peer cannot be reached (down, partitioned away, or unknown).
    Unreachable(u64),
    /// The connection or call itself failed.
    Transport(String),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Unreachable(peer) => write!(f, "peer {} unreachable", peer),
            RpcError::Transport(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

impl std::error::Error for RpcError {}

/// Outbound RPC surface. A failed call is indistinguishable from a lost
/// message; the core just retries on its own cadence.
#[tonic::async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    async fn request_vote(
        &self,
        to: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, RpcError>;

    async fn append_entries(
        &self,
        to: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, RpcError>;

    async fn install_snapshot(
        &self,
        to: u64,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotReply, RpcError>;
}

struct RouterInner {
    nodes: HashMap<u64, Arc<Raft>>,
    /// Partition group per node; messages flow only within a group.
    groups: HashMap<u64, u64>,
}

/// In-process message router. Register every node, then hand each one a
/// [`LocalTransport`] bound to its id.
pub struct LocalRouter {
    inner: Mutex<RouterInner>,
}

impl LocalRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(LocalRouter {
            inner: Mutex::new(RouterInner {
                nodes: HashMap::new(),
                groups: HashMap::new(),
            }),
        })
    }

    pub fn register(&self, id: u64, raft: Arc<Raft>) {
        let mut inner = self.inner.lock().unwrap();
        inner.nodes.insert(id, raft);
        inner.groups.entry(id).or_insert(0);
    }

    /// Take the node off the network entirely, as a crash would.
    pub fn remove(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.nodes.remove(&id);
        inner.groups.remove(&id);
    }

    /// Move a node into a partition group.
    pub fn set_group(&self, id: u64, group: u64) {
        self.inner.lock().unwrap().groups.insert(id, group);
    }

    /// Heal all partitions.
    pub fn heal(&self) {
        let mut inner = self.inner.lock().unwrap();
        for group in inner.groups.values_mut() {
            *group = 0;
        }
    }

    fn route(&self, from: u64, to: u64) -> Result<Arc<Raft>, RpcError> {
        let inner = self.inner.lock().unwrap();
        let reachable = match (inner.groups.get(&from), inner.groups.get(&to)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };
        if !reachable {
            return Err(RpcError::Unreachable(to));
        }
        inner
            .nodes
            .get(&to)
            .cloned()
            .ok_or(RpcError::Unreachable(to))
    }
}

/// One node's view of the [`LocalRouter`].
pub struct LocalTransport {
    me: u64,
    router: Arc<LocalRouter>,
}

impl LocalTransport {
    pub fn new(me: u64, router: Arc<LocalRouter>) -> Self {
        LocalTransport { me, router }
    }
}

#[tonic::async_trait]
impl RaftTransport for LocalTransport {
    async fn request_vote(
        &self,
        to: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, RpcError> {
        let target = self.router.route(self.me, to)?;
        Ok(target.handle_request_vote(args))
    }

    async fn append_entries(
        &self,
        to: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, RpcError> {
        let target = self.router.route(self.me, to)?;
        Ok(target.handle_append_entries(args))
    }

    async fn install_snapshot(
        &self,
        to: u64,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotReply, RpcError> {
        let target = self.router.route(self.me, to)?;
        Ok(target.handle_install_snapshot(args))
    }
}
