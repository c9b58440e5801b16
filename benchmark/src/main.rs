//! Start-to-apply latency benchmark against an in-process replication group.

use clap::Parser;
use hdrhistogram::Histogram;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;

use replica::raft::node::Raft;
use replica::raft::storage::{MemStorage, Storage};
use replica::raft::ApplyMsg;
use replica::state::KvCommand;
use replica::transport::{LocalRouter, LocalTransport, RaftTransport};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of nodes in the in-process group
    #[arg(short, long, default_value = "3")]
    nodes: u64,

    /// Number of concurrent proposers
    #[arg(short, long, default_value = "1")]
    concurrency: usize,

    /// Duration of the benchmark in seconds
    #[arg(short, long, default_value = "30")]
    duration: u64,
}

struct BenchNode {
    raft: Arc<Raft>,
    /// Highest index this node's upstream has applied.
    applied: Arc<AtomicU64>,
}

/// Spin up `n` nodes wired through a LocalRouter, each with a collector that
/// tracks its applied watermark.
fn build_group(n: u64) -> Vec<BenchNode> {
    let router = LocalRouter::new();
    let peers: Vec<u64> = (0..n).collect();
    let mut nodes = Vec::new();

    for id in 0..n {
        let (apply_tx, mut apply_rx) = mpsc::channel(1024);
        let transport: Arc<dyn RaftTransport> = Arc::new(LocalTransport::new(id, router.clone()));
        let raft = Raft::new(
            peers.clone(),
            id,
            Arc::new(MemStorage::new()) as Arc<dyn Storage>,
            transport,
            apply_tx,
        );
        router.register(id, raft.clone());

        let applied = Arc::new(AtomicU64::new(0));
        let watermark = applied.clone();
        tokio::spawn(async move {
            while let Some(msg) = apply_rx.recv().await {
                if let ApplyMsg::Command { index, .. } = msg {
                    watermark.fetch_max(index, Ordering::SeqCst);
                }
            }
        });

        nodes.push(BenchNode { raft, applied });
    }
    nodes
}

async fn wait_for_leader(nodes: &[BenchNode]) -> usize {
    loop {
        for (pos, node) in nodes.iter().enumerate() {
            if node.raft.get_state().1 {
                return pos;
            }
        }
        sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();

    let nodes = Arc::new(build_group(args.nodes));
    let leader = wait_for_leader(&nodes).await;
    println!(
        "Group of {} up, node {} leading; running {} proposers for {}s",
        args.nodes, leader, args.concurrency, args.duration
    );

    let histogram = Arc::new(Mutex::new(Histogram::<u64>::new(3).unwrap()));

    let mut proposers = vec![];
    for worker in 0..args.concurrency {
        let nodes = nodes.clone();
        let histogram = histogram.clone();

        proposers.push(tokio::spawn(async move {
            let mut seq = 0u64;
            loop {
                let leader = wait_for_leader(&nodes).await;
                let command = bincode::serialize(&KvCommand {
                    key: format!("bench-{}-{}", worker, seq),
                    value: seq.to_string(),
                })
                .unwrap();

                let start = Instant::now();
                let (index, _, ok) = nodes[leader].raft.start(command);
                if !ok {
                    continue;
                }
                // Committed once this proposer's node has applied it.
                while nodes[leader].applied.load(Ordering::SeqCst) < index {
                    sleep(Duration::from_millis(1)).await;
                }
                histogram
                    .lock()
                    .await
                    .record(start.elapsed().as_micros() as u64)
                    .unwrap();
                seq += 1;
            }
        }));
    }

    sleep(Duration::from_secs(args.duration)).await;
    for proposer in proposers {
        proposer.abort();
    }

    // Freeze the group before reading the watermarks, so the lag column
    // reflects replication at stop time rather than a still-moving tail.
    for node in nodes.iter() {
        node.raft.kill();
    }

    let hist = histogram.lock().await;
    let committed = hist.len();
    println!(
        "\ncommitted {} commands, {:.1} per second",
        committed,
        committed as f64 / args.duration as f64
    );
    println!(
        "start-to-apply latency: p50 {}us, p95 {}us, p99 {}us, worst {}us",
        hist.value_at_percentile(50.0),
        hist.value_at_percentile(95.0),
        hist.value_at_percentile(99.0),
        hist.max()
    );

    let head = nodes
        .iter()
        .map(|node| node.applied.load(Ordering::SeqCst))
        .max()
        .unwrap_or(0);
    println!("\nper-node apply progress (head {}):", head);
    for (id, node) in nodes.iter().enumerate() {
        let applied = node.applied.load(Ordering::SeqCst);
        println!("  node {}: applied {} (lag {})", id, applied, head - applied);
    }

    Ok(())
}
