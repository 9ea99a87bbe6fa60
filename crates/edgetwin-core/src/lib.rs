//! Edge digital twin core
//!
//! This crate provides the edge-resident twin service:
//! - A shared context holding the twin registry, per-device locks and the
//!   pending-message cache
//! - Actor-style modules with bounded mailboxes and heartbeats
//! - Routing toward device and cloud transports with retry and expiry
//! - Merge-patch updates of twin state and properties

pub mod context;
pub mod egress;
pub mod envelope;
pub mod error;
pub mod module;
pub mod twin;

pub use context::{ContextConfig, Heartbeat, ModuleChannels, PendingMessage, TwinContext};
pub use egress::{ChannelEgress, Egress};
pub use envelope::Envelope;
pub use error::{Result, TwinError};
pub use module::comm::{Route, SweepStats};
pub use module::{CommModule, DeviceModule, PropertyModule, TwinModule};
pub use twin::{DigitalTwin, ResponseStatus, TwinMessage, TwinProperties, TwinResponse};
