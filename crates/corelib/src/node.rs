//! Node identity abstractions.
//!
//! Nodes are the participants of the communication mesh. They are identified
//! by a compact `NodeId` that is cheap to compare and hash; a `NodeIdentity`
//! adds the per-process session id and a display name.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Compact identifier for a node in the mesh.
///
/// Newtype over `u128` so comparisons and hashing are very fast while giving
/// plenty of space for uniqueness. Serialized as a 32 digit hex string.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct NodeId(pub u128);

impl NodeId {
    /// Generate a fresh random node id.
    pub fn random() -> Self {
        NodeId(uuid::Uuid::new_v4().as_u128())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u128::from_str_radix(s, 16)
            .map(NodeId)
            .map_err(|e| Error::Protocol(format!("invalid node id '{}': {}", s, e)))
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for NodeId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Identity of a running node instance.
///
/// Two identities are equal only if node id, session id and display name all
/// match; a restarted node gets a new session id and therefore compares
/// unequal to its previous incarnation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_id: NodeId,
    /// Random per-process session id.
    pub session_id: u64,
    /// Human‑readable name.
    pub display_name: String,
}

impl NodeIdentity {
    /// Construct an identity with a fresh session id.
    pub fn new(node_id: NodeId, display_name: impl Into<String>) -> Self {
        Self {
            node_id,
            session_id: rand::random(),
            display_name: display_name.into(),
        }
    }

    pub fn with_session(node_id: NodeId, session_id: u64, display_name: impl Into<String>) -> Self {
        Self {
            node_id,
            session_id,
            display_name: display_name.into(),
        }
    }

    /// Short description for log output, e.g. `"node-a [0000..01]"`.
    pub fn log_description(&self) -> String {
        format!("{} [{}]", self.display_name, self.node_id)
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.log_description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_string_round_trip() {
        let id = NodeId(0xdead_beef);
        let text = id.to_string();
        assert_eq!(text.len(), 32);
        assert_eq!(text.parse::<NodeId>().unwrap(), id);
    }

    #[test]
    fn test_node_id_rejects_garbage() {
        assert!(matches!("not-hex".parse::<NodeId>(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_identity_equality_includes_session() {
        let a = NodeIdentity::with_session(NodeId(1), 7, "node");
        let b = NodeIdentity::with_session(NodeId(1), 7, "node");
        let restarted = NodeIdentity::with_session(NodeId(1), 8, "node");
        assert_eq!(a, b);
        assert_ne!(a, restarted);
    }

    #[test]
    fn test_identity_json_uses_hex_node_id() {
        let identity = NodeIdentity::with_session(NodeId(255), 1, "n");
        let json = serde_json::to_string(&identity).unwrap();
        assert!(json.contains("000000000000000000000000000000ff"));
        let back: NodeIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, identity);
    }
}
