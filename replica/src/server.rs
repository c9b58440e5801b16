//! Node wiring: storage, transport, the Raft core, the upstream apply loop,
//! and the gRPC + metrics listeners.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Duration;

use crate::config;
use crate::metrics;
use crate::raft::node::Raft;
use crate::raft::storage::{FileStorage, Storage};
use crate::raft::ApplyMsg;
use crate::raft_client::GrpcTransport;
use crate::raft_service::pb::raft_service_server::RaftServiceServer;
use crate::raft_service::RaftServiceSVC;
use crate::state::{KvCommand, KvState, StateMachine};

static INSTANCE: OnceCell<Mutex<Server>> = OnceCell::new();
pub fn instance() -> &'static Mutex<Server> {
    INSTANCE.get_or_init(|| Mutex::new(Server::builder()))
}

pub struct Server {
    raft: Arc<Raft>,
    /// Taken by the apply loop when the server starts.
    apply_rx: Option<mpsc::Receiver<ApplyMsg>>,
    storage: Arc<FileStorage>,
}

impl Server {
    fn builder() -> Self {
        let cfg = config::instance().lock().unwrap().clone();
        let storage =
            Arc::new(FileStorage::new(&cfg.base_path).expect("raft storage init failed"));

        let peers: Vec<u64> = cfg.node_list.iter().map(|n| n.id).collect();
        let addrs: HashMap<u64, String> = cfg
            .node_list
            .iter()
            .map(|n| (n.id, n.addr.clone()))
            .collect();
        let transport = Arc::new(GrpcTransport::new(addrs));

        let (apply_tx, apply_rx) = mpsc::channel(1024);
        let raft = Raft::new(
            peers,
            cfg.id,
            storage.clone() as Arc<dyn Storage>,
            transport,
            apply_tx,
        );

        Server {
            raft,
            apply_rx: Some(apply_rx),
            storage,
        }
    }

    pub async fn start(&mut self) {
        self.start_apply_loop();
        self.start_grpc_server().await;
        let metrics_addr = config::instance()
            .lock()
            .unwrap()
            .metrics_addr
            .parse()
            .expect("metrics_addr is not a socket address");
        metrics::spawn_exporter(metrics_addr);
        self.seed_traffic();
    }

    pub fn stop(&mut self) {
        log::info!("server stop");
        self.raft.kill();
    }

    /// Drain the apply channel into the key/value machine, snapshotting every
    /// `snapshot_threshold` applied commands and acknowledging leader-sent
    /// snapshots through the conditional install gate.
    fn start_apply_loop(&mut self) {
        let raft = self.raft.clone();
        let mut apply_rx = self.apply_rx.take().expect("apply loop already running");
        let threshold = config::instance().lock().unwrap().snapshot_threshold;

        let mut kv = KvState::new();
        kv.on_snapshot(0, 0, &self.storage.read_snapshot());
        let mut last_snapshot = kv.applied_index();

        tokio::spawn(async move {
            while let Some(msg) = apply_rx.recv().await {
                match msg {
                    ApplyMsg::Command { index, command } => {
                        kv.apply(index, &command);
                        if threshold > 0 && index >= last_snapshot + threshold {
                            raft.snapshot(index, kv.snapshot());
                            last_snapshot = index;
                        }
                    }
                    ApplyMsg::Snapshot { index, term, data } => {
                        if raft.cond_install_snapshot(term, index, data.clone()) {
                            kv.on_snapshot(index, term, &data);
                            last_snapshot = index;
                            log::info!("adopted snapshot through index {}", index);
                        }
                    }
                }
            }
        });
    }

    async fn start_grpc_server(&mut self) {
        let addr = config::instance()
            .lock()
            .unwrap()
            .addr
            .parse()
            .expect("addr is not a socket address");
        let raft_service = RaftServiceSVC::new(self.raft.clone());
        let serve = tonic::transport::Server::builder()
            .add_service(RaftServiceServer::new(raft_service))
            .serve(addr);
        tokio::spawn(async move {
            if let Err(e) = serve.await {
                log::error!("raft rpc listener exited: {}", e);
            }
        });
        log::info!("raft rpc listener on {}", addr);
    }

    /// When enabled, generates a trickle of sample commands while this node
    /// leads, so a fresh cluster exercises the full pipeline.
    fn seed_traffic(&self) {
        if !config::instance().lock().unwrap().seed_traffic {
            return;
        }
        let raft = self.raft.clone();
        tokio::spawn(async move {
            let mut counter = 0u64;
            while !raft.killed() {
                let command = bincode::serialize(&KvCommand {
                    key: format!("seed-{}", counter % 64),
                    value: counter.to_string(),
                })
                .expect("seed command is always encodable");
                let (index, _, is_leader) = raft.start(command);
                if is_leader {
                    log::info!("seeded command {} at index {}", counter, index);
                    counter += 1;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
    }
}
