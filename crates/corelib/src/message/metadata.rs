//! Message metadata map.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::node::NodeId;

const KEY_SENDER: &str = "sender";
const KEY_FINAL_RECIPIENT: &str = "finalRecipient";
const KEY_HOP_COUNT: &str = "hopCount";

/// String key/value metadata attached to requests and responses.
///
/// Serialized as a JSON object into a single wire property.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    entries: BTreeMap<String, String>,
}

impl MessageMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn sender(&self) -> Option<NodeId> {
        self.get(KEY_SENDER).and_then(|s| s.parse().ok())
    }

    pub fn has_sender(&self) -> bool {
        self.entries.contains_key(KEY_SENDER)
    }

    pub fn set_sender(&mut self, sender: NodeId) {
        self.set(KEY_SENDER, sender.to_string());
    }

    /// Node the request is ultimately addressed to; `None` means "the
    /// receiving node".
    pub fn final_recipient(&self) -> Option<NodeId> {
        self.get(KEY_FINAL_RECIPIENT).and_then(|s| s.parse().ok())
    }

    pub fn set_final_recipient(&mut self, recipient: NodeId) {
        self.set(KEY_FINAL_RECIPIENT, recipient.to_string());
    }

    pub fn hop_count(&self) -> u32 {
        self.get(KEY_HOP_COUNT).and_then(|s| s.parse().ok()).unwrap_or(0)
    }

    pub fn increment_hop_count(&mut self) {
        let next = self.hop_count() + 1;
        self.set(KEY_HOP_COUNT, next.to_string());
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_fields() {
        let mut meta = MessageMetadata::new();
        assert!(!meta.has_sender());
        assert_eq!(meta.final_recipient(), None);

        meta.set_sender(NodeId(1));
        meta.set_final_recipient(NodeId(2));
        meta.increment_hop_count();
        meta.increment_hop_count();

        assert_eq!(meta.sender(), Some(NodeId(1)));
        assert_eq!(meta.final_recipient(), Some(NodeId(2)));
        assert_eq!(meta.hop_count(), 2);
    }

    #[test]
    fn test_json_form() {
        let mut meta = MessageMetadata::new();
        meta.set("custom", "value");
        let json = meta.to_json().unwrap();
        assert_eq!(MessageMetadata::from_json(&json).unwrap(), meta);
        assert!(MessageMetadata::from_json("[1,2]").is_err());
    }
}
