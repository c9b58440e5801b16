//! Prometheus instrumentation for the raft node.
//!
//! Inbound RPCs are counted by method and protocol outcome (vote granted or
//! denied, append ok / conflict / stale term, snapshot accepted or stale), so
//! a dashboard can tell replication conflicts from term churn without log
//! diving. The text-format scrape endpoint lives here too.

use std::net::SocketAddr;
use std::time::Instant;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Inbound raft RPCs by method and protocol outcome
    pub static ref RAFT_RPC_COUNTER_VEC: CounterVec = CounterVec::new(
        Opts::new("raft_rpc_handled", "inbound raft rpcs by method and outcome"),
        &["method", "outcome"]
    )
    .unwrap();

    /// Handling time per RPC method, lock wait included
    pub static ref RAFT_RPC_COST_VEC: HistogramVec = HistogramVec::new(
        HistogramOpts::new("raft_rpc_cost", "raft rpc handling cost in seconds"),
        &["method"]
    )
    .unwrap();
}

/// Registers all metric collectors with the global registry
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(RAFT_RPC_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(RAFT_RPC_COST_VEC.clone()));
}

/// Record one handled RPC: bump the method/outcome counter and observe the
/// handling time. `outcome` is the protocol-level result the reply encodes,
/// not a transport status.
pub fn observe_rpc(method: &'static str, outcome: &'static str, started: Instant) {
    RAFT_RPC_COUNTER_VEC
        .with_label_values(&[method, outcome])
        .inc();
    RAFT_RPC_COST_VEC
        .with_label_values(&[method])
        .observe(started.elapsed().as_secs_f64());
}

async fn render_scrape(_req: Request<Body>) -> Result<Response<Body>, hyper::Error> {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&REGISTRY_INSTANCE.gather(), &mut buffer) {
        log::warn!("metrics encode failed: {}", e);
    }
    Ok(Response::new(Body::from(buffer)))
}

/// Spawn the scrape endpoint on `addr`. Every request renders the whole
/// registry in the Prometheus text format.
pub fn spawn_exporter(addr: SocketAddr) {
    init_registry();
    let make_svc =
        make_service_fn(|_conn| async { Ok::<_, hyper::Error>(service_fn(render_scrape)) });
    tokio::spawn(async move {
        if let Err(e) = hyper::Server::bind(&addr).serve(make_svc).await {
            log::error!("metrics exporter exited: {}", e);
        }
    });
    log::info!("metrics exporter listening on {}", addr);
}
