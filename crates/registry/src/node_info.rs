//! Knowledge about remote nodes learned from handshakes.

use dashmap::DashMap;
use tracing::debug;

use corelib::{NodeId, NodeIdentity};

/// Latest known identity per node id.
#[derive(Default)]
pub struct NodeInformationRegistry {
    nodes: DashMap<NodeId, NodeIdentity>,
}

impl NodeInformationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `identity`. Returns `true` if it was new or replaced a
    /// different identity (e.g. a restarted node with a new session).
    pub fn merge(&self, identity: &NodeIdentity) -> bool {
        let previous = self.nodes.insert(identity.node_id, identity.clone());
        let changed = previous.as_ref() != Some(identity);
        if changed {
            debug!(node = %identity, "Updated node information");
        }
        changed
    }

    pub fn get(&self, node_id: NodeId) -> Option<NodeIdentity> {
        self.nodes.get(&node_id).map(|entry| entry.value().clone())
    }

    /// Display name of `node_id`, falling back to the id itself.
    pub fn display_name(&self, node_id: NodeId) -> String {
        self.get(node_id)
            .map(|identity| identity.display_name)
            .unwrap_or_else(|| node_id.to_string())
    }

    pub fn known_nodes(&self) -> Vec<NodeIdentity> {
        self.nodes.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_tracks_session_changes() {
        let registry = NodeInformationRegistry::new();
        let first = NodeIdentity::with_session(NodeId(1), 10, "node-a");
        assert!(registry.merge(&first));
        assert!(!registry.merge(&first));

        let restarted = NodeIdentity::with_session(NodeId(1), 11, "node-a");
        assert!(registry.merge(&restarted));
        assert_eq!(registry.get(NodeId(1)), Some(restarted));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_display_name_fallback() {
        let registry = NodeInformationRegistry::new();
        assert_eq!(registry.display_name(NodeId(2)), NodeId(2).to_string());
        registry.merge(&NodeIdentity::new(NodeId(2), "node-b"));
        assert_eq!(registry.display_name(NodeId(2)), "node-b");
    }
}
