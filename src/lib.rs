//! # fanout
//!
//! Cluster-wide HTTP request replication for a single logical coordinator:
//! - Fan one inbound API call out to every data-plane node
//! - Two-phase commit for mutating calls (verification round, then apply)
//! - Bounded worker pool, per-hop timeouts, partial-failure handling
//! - Response aggregation through a pluggable merger
//! - Slow-node detection with hysteresis and TTL-based garbage collection
//!
//! ## Architecture
//!
//! ```text
//!  Caller ──► Replicator ──► StateGuard (mutating requests only)
//!                 │
//!                 ├─► worker pool ×N ──► NodeClient ──► node A,B,C…
//!                 │                          │
//!                 ▼                          ▼
//!          RequestRegistry ◄──── ResponseAggregator ──► ResponseMerger
//!                 ▲                                          │
//!          MaintenanceLoop (TTL sweep)              merged payload ──► Caller
//! ```
//!
//! A mutating request first replicates a verification request carrying
//! `X-Verify-Intent: 150-NodeContinue`; every node must answer the sentinel
//! status 150 before the real request is dispatched. A single dissent (417,
//! any other status, or a transport failure) aborts without applying.

pub mod cluster;
pub mod common;
pub mod merge;
pub mod replication;

// Re-export commonly used types
pub use cluster::{ClusterDirectory, EventSink, FlowStateTracker, NodeId};
pub use common::{Error, ReplicatorConfig, Result};
pub use merge::{MergedResponse, ResponseMerger};
pub use replication::{Entity, NodeClient, NodeResponse, Replicator, ResponseAggregator};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
