//! Cluster-state gate for mutating requests

use crate::cluster::{ClusterDirectory, NodeConnectionState};
use reqwest::Method;
use std::sync::Arc;

/// DELETE, POST and PUT change cluster state; everything else is read-only.
pub fn is_mutating(method: &Method) -> bool {
    matches!(*method, Method::DELETE | Method::POST | Method::PUT)
}

/// Rejects mutating requests while any node is in a transitional connection
/// state. Read-only requests always pass.
pub struct StateGuard {
    directory: Arc<dyn ClusterDirectory>,
}

impl StateGuard {
    pub fn new(directory: Arc<dyn ClusterDirectory>) -> Self {
        Self { directory }
    }

    pub fn check(&self, method: &Method, path: &str) -> crate::Result<()> {
        if !is_mutating(method) {
            return Ok(());
        }

        let states = self.directory.connection_states();
        if states.contains_key(&NodeConnectionState::Disconnected)
            || states.contains_key(&NodeConnectionState::Disconnecting)
        {
            return Err(crate::Error::DisconnectedNodeRejection {
                method: method.clone(),
                path: path.to_string(),
            });
        }
        if states.contains_key(&NodeConnectionState::Connecting) {
            return Err(crate::Error::ConnectingNodeRejection {
                method: method.clone(),
                path: path.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::NodeId;
    use std::collections::HashMap;

    struct FixedDirectory(HashMap<NodeConnectionState, Vec<NodeId>>);

    impl ClusterDirectory for FixedDirectory {
        fn connection_states(&self) -> HashMap<NodeConnectionState, Vec<NodeId>> {
            self.0.clone()
        }

        fn nodes(&self) -> Vec<NodeId> {
            self.0.values().flatten().cloned().collect()
        }
    }

    fn guard(state: NodeConnectionState) -> StateGuard {
        let mut states = HashMap::new();
        states.insert(state, vec![NodeId::new("a", "localhost", 1)]);
        StateGuard::new(Arc::new(FixedDirectory(states)))
    }

    #[test]
    fn test_read_only_always_passes() {
        let guard = guard(NodeConnectionState::Disconnected);
        assert!(guard.check(&Method::GET, "/api").is_ok());
        assert!(guard.check(&Method::HEAD, "/api").is_ok());
        assert!(guard.check(&Method::OPTIONS, "/api").is_ok());
    }

    #[test]
    fn test_mutating_rejected_while_disconnected() {
        let guard = guard(NodeConnectionState::Disconnected);
        assert!(matches!(
            guard.check(&Method::PUT, "/api"),
            Err(crate::Error::DisconnectedNodeRejection { .. })
        ));
    }

    #[test]
    fn test_mutating_rejected_while_disconnecting() {
        let guard = guard(NodeConnectionState::Disconnecting);
        assert!(matches!(
            guard.check(&Method::DELETE, "/api"),
            Err(crate::Error::DisconnectedNodeRejection { .. })
        ));
    }

    #[test]
    fn test_mutating_rejected_while_connecting() {
        let guard = guard(NodeConnectionState::Connecting);
        assert!(matches!(
            guard.check(&Method::POST, "/api"),
            Err(crate::Error::ConnectingNodeRejection { .. })
        ));
    }

    #[test]
    fn test_mutating_allowed_when_all_connected() {
        let guard = guard(NodeConnectionState::Connected);
        assert!(guard.check(&Method::PUT, "/api").is_ok());
    }
}
