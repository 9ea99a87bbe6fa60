//! Message envelope exchanged between modules and transports

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Operation names carried in [`Envelope::operation`]
pub mod ops {
    pub const UPDATE: &str = "Update";
    pub const DELETE: &str = "Delete";
    pub const GET: &str = "Get";
    pub const WATCH: &str = "Watch";
    pub const SYNC: &str = "Sync";
    pub const CREATE: &str = "Create";
    pub const RESPONSE: &str = "Response";
}

/// Resource names carried in [`Envelope::resource`]
pub mod resources {
    pub const TWINS: &str = "twins";
    pub const DEVICE: &str = "device";
    pub const PROPERTY: &str = "property";
}

/// Routing targets understood by the communication module
pub mod targets {
    /// Physical devices, reached through the bus egress
    pub const DEVICE: &str = "device";
    /// Prefix for cloud-bound traffic
    pub const CLOUD_PREFIX: &str = "cloud";
    /// Prefix for edge-local peers, including this service
    pub const EDGE_PREFIX: &str = "edge";
}

/// Routed message with request/response correlation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,
    /// ID of the request this envelope answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub source: String,
    pub target: String,
    pub resource: String,
    pub operation: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    #[serde(default)]
    pub content: Vec<u8>,
}

impl Envelope {
    /// Fresh envelope with a new ID and the current timestamp
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        operation: impl Into<String>,
        resource: impl Into<String>,
        content: Vec<u8>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tag: None,
            source: source.into(),
            target: target.into(),
            resource: resource.into(),
            operation: operation.into(),
            timestamp: Utc::now().timestamp_millis(),
            content,
        }
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn is_response(&self) -> bool {
        self.operation == ops::RESPONSE
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{} {} -> {}",
            self.id, self.operation, self.resource, self.source, self.target
        )
    }
}
