//! Digital twin records and the twin batch payloads carried in envelopes
//!
//! Twins are the in-memory shadow of one device. Mutation is merge-patch:
//! only fields and keys present in a patch overwrite stored state.

use crate::error::{Result, TwinError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// State value used when a device stops answering
pub const STATE_OFFLINE: &str = "offline";

/// State value for a device that answers
pub const STATE_ONLINE: &str = "online";

/// Value stored under a desired or reported property
pub type PropertyValue = serde_json::Value;

/// Desired and reported property maps of a twin
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TwinProperties {
    pub desired: BTreeMap<String, PropertyValue>,
    pub reported: BTreeMap<String, PropertyValue>,
}

impl TwinProperties {
    /// Key-level last-write-wins merge of both maps
    pub fn merge(&mut self, patch: &Self) {
        for (key, value) in &patch.desired {
            self.desired.insert(key.clone(), value.clone());
        }
        for (key, value) in &patch.reported {
            self.reported.insert(key.clone(), value.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.desired.is_empty() && self.reported.is_empty()
    }
}

/// Shadow record for one physical or logical device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigitalTwin {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub last_state: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub properties: TwinProperties,
}

impl DigitalTwin {
    /// Create an empty twin for a device ID
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Builder-style state setter
    #[must_use]
    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = state.into();
        self
    }

    /// Builder-style desired property setter
    #[must_use]
    pub fn with_desired(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.desired.insert(key.into(), value.into());
        self
    }

    /// Builder-style reported property setter
    #[must_use]
    pub fn with_reported(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.reported.insert(key.into(), value.into());
        self
    }

    /// Builder-style metadata setter
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Apply identity, state and metadata fields of a patch.
    ///
    /// Properties are left alone; they belong to the property module.
    pub fn apply_patch(&mut self, patch: &Self) {
        if !patch.name.is_empty() {
            self.name.clone_from(&patch.name);
        }
        if !patch.description.is_empty() {
            self.description.clone_from(&patch.description);
        }
        if !patch.state.is_empty() {
            self.last_state = std::mem::replace(&mut self.state, patch.state.clone());
        }
        for (key, value) in &patch.metadata {
            self.metadata.insert(key.clone(), value.clone());
        }
    }

    /// Whether the patch asks for desired property changes
    pub fn has_desired(&self) -> bool {
        !self.properties.desired.is_empty()
    }
}

impl fmt::Display for DigitalTwin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.id, self.state)
    }
}

/// Batch of twin records, the request payload of every twin operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwinMessage {
    #[serde(default)]
    pub twins: Vec<DigitalTwin>,
}

impl TwinMessage {
    pub fn new(twins: Vec<DigitalTwin>) -> Self {
        Self { twins }
    }

    /// Decode an envelope payload
    pub fn decode(content: &[u8]) -> Result<Self> {
        serde_json::from_slice(content).map_err(TwinError::InvalidContent)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(TwinError::Encode)
    }
}

/// Outcome reported back to the sender of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Success,
    NotFound,
    Deleted,
    InternalError,
}

impl ResponseStatus {
    /// Numeric code carried next to the status
    pub fn code(self) -> u16 {
        match self {
            Self::Success | Self::Deleted => 200,
            Self::NotFound => 404,
            Self::InternalError => 500,
        }
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "Success",
            Self::NotFound => "NotFound",
            Self::Deleted => "Deleted",
            Self::InternalError => "InternalError",
        };
        f.write_str(s)
    }
}

/// Response body sent back through the communication module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwinResponse {
    pub code: u16,
    pub status: ResponseStatus,
    #[serde(default)]
    pub twins: Vec<DigitalTwin>,
}

impl TwinResponse {
    pub fn new(status: ResponseStatus, twins: Vec<DigitalTwin>) -> Self {
        Self {
            code: status.code(),
            status,
            twins,
        }
    }

    pub fn decode(content: &[u8]) -> Result<Self> {
        serde_json::from_slice(content).map_err(TwinError::InvalidContent)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(TwinError::Encode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_merge_is_additive() {
        let mut twin = DigitalTwin::new("d1").with_metadata("a", "1");
        twin.apply_patch(&DigitalTwin::new("d1").with_metadata("b", "2"));

        assert_eq!(twin.metadata.get("a").map(String::as_str), Some("1"));
        assert_eq!(twin.metadata.get("b").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_state_keeps_one_slot_history() {
        let mut twin = DigitalTwin::new("d1").with_state(STATE_ONLINE);
        twin.apply_patch(&DigitalTwin::new("d1").with_state(STATE_OFFLINE));

        assert_eq!(twin.state, STATE_OFFLINE);
        assert_eq!(twin.last_state, STATE_ONLINE);
    }

    #[test]
    fn test_empty_fields_do_not_overwrite() {
        let mut twin = DigitalTwin::new("d1").with_state(STATE_ONLINE);
        twin.name = "lamp".to_string();
        twin.apply_patch(&DigitalTwin::new("d1"));

        assert_eq!(twin.name, "lamp");
        assert_eq!(twin.state, STATE_ONLINE);
        assert!(twin.last_state.is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = TwinMessage::decode(b"not json").unwrap_err();
        assert!(matches!(err, TwinError::InvalidContent(_)));
    }

    #[test]
    fn test_decode_fills_missing_fields() {
        let msg = TwinMessage::decode(br#"{"twins":[{"id":"d1","properties":{"desired":{"brightness":"80"}}}]}"#)
            .unwrap();
        let twin = &msg.twins[0];
        assert_eq!(twin.id, "d1");
        assert!(twin.metadata.is_empty());
        assert!(twin.properties.reported.is_empty());
        assert_eq!(twin.properties.desired["brightness"], "80");
    }
}
