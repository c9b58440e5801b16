//! Replicated log node built on a from-scratch Raft core.
//!
//! The `raft` module owns consensus: elections, replication with
//! fast-rollback recovery, snapshots, and the apply pipeline. The rest of the
//! crate is the service shell around it: configuration, metrics, the gRPC
//! wire, and the upstream state-machine seam.

pub mod config;
pub mod metrics;
pub mod raft;
pub mod raft_client;
pub mod raft_service;
pub mod server;
pub mod state;
pub mod transport;
