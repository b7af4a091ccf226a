//! Cluster collaborators seen by the replicator
//!
//! The replicator does not own cluster membership, event reporting or flow
//! state. It talks to those subsystems through the traits defined here:
//! - [`ClusterDirectory`]: node identities and connection states
//! - [`EventSink`]: operator-visible warnings
//! - [`FlowStateTracker`]: notified when a mutation begins / completes

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

/// Identity of one data-plane node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub id: String,
    pub api_host: String,
    pub api_port: u16,
}

impl NodeId {
    pub fn new(id: impl Into<String>, api_host: impl Into<String>, api_port: u16) -> Self {
        Self {
            id: id.into(),
            api_host: api_host.into(),
            api_port,
        }
    }

    /// host:port of the node's API
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Connection state of a node as reported by the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeConnectionState {
    Connected,
    Connecting,
    Disconnecting,
    Disconnected,
}

/// Enumerates node identities and their connection states
pub trait ClusterDirectory: Send + Sync {
    /// Current connection states, grouped by state
    fn connection_states(&self) -> HashMap<NodeConnectionState, Vec<NodeId>>;

    /// All nodes known to the directory
    fn nodes(&self) -> Vec<NodeId>;
}

/// Fixed node list, every node permanently connected. Used by the CLI and
/// in tests; production callers plug in their own directory.
pub struct StaticClusterDirectory {
    nodes: Vec<NodeId>,
}

impl StaticClusterDirectory {
    pub fn new(nodes: Vec<NodeId>) -> Self {
        Self { nodes }
    }
}

impl ClusterDirectory for StaticClusterDirectory {
    fn connection_states(&self) -> HashMap<NodeConnectionState, Vec<NodeId>> {
        let mut states = HashMap::new();
        states.insert(NodeConnectionState::Connected, self.nodes.clone());
        states
    }

    fn nodes(&self) -> Vec<NodeId> {
        self.nodes.clone()
    }
}

/// Severity of a reported event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
}

/// Sink for operator-visible events
pub trait EventSink: Send + Sync {
    fn report(&self, severity: Severity, category: &str, message: &str);
}

/// Reports events through `tracing`
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn report(&self, severity: Severity, category: &str, message: &str) {
        match severity {
            Severity::Info => tracing::info!("[{}] {}", category, message),
            Severity::Warning => tracing::warn!("[{}] {}", category, message),
        }
    }
}

/// Persisted flow state as seen by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Current,
    Stale,
    Unknown,
}

/// Notified when a mutating cluster request begins (state becomes `Unknown`)
/// and when it completes (state becomes `Stale`).
pub trait FlowStateTracker: Send + Sync {
    fn set_flow_state(&self, state: FlowState);
}

/// Tracker that remembers the last recorded state
pub struct SharedFlowState {
    state: Mutex<FlowState>,
}

impl SharedFlowState {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FlowState::Current),
        }
    }

    pub fn current(&self) -> FlowState {
        *self.state.lock().unwrap()
    }
}

impl Default for SharedFlowState {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowStateTracker for SharedFlowState {
    fn set_flow_state(&self, state: FlowState) {
        *self.state.lock().unwrap() = state;
    }
}
