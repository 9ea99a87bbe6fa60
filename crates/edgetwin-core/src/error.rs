//! Error taxonomy for the twin context and its modules
//!
//! None of these are fatal to a module loop: handlers log the error and the
//! loop moves on to the next mailbox item. [`TwinError::Stopped`] is the one
//! variant that ends a loop, and it is an expected shutdown path.

use thiserror::Error;

/// Errors produced by the twin context and processing modules
#[derive(Debug, Error)]
pub enum TwinError {
    /// No mailbox or egress registered under this name
    #[error("module not found: {0}")]
    ModuleNotFound(String),

    /// A module with this name is already registered
    #[error("module already registered: {0}")]
    ModuleAlreadyRegistered(String),

    /// The module was used before the context initialised it
    #[error("module {0} has not been registered with a context")]
    NotRegistered(String),

    /// Envelope payload could not be decoded
    #[error("invalid message content: {0}")]
    InvalidContent(#[source] serde_json::Error),

    /// Registry entry does not match the key it is stored under
    #[error("invalid digital twin record stored for {0}")]
    InvalidTwinType(String),

    /// Operation against an unregistered device
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// No handler is registered for the requested operation
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    /// Handler slot exists but has no implementation yet
    #[error("operation not implemented: {0}")]
    NotImplemented(String),

    /// Encoding an outbound payload failed
    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    /// Target mailbox has been dropped
    #[error("mailbox closed: {0}")]
    MailboxClosed(String),

    /// Target mailbox is at capacity and the send was not allowed to wait
    #[error("mailbox full: {0}")]
    MailboxFull(String),

    /// Heartbeat asked the module loop to terminate
    #[error("module stopped")]
    Stopped,
}

/// Result alias used across the core crate
pub type Result<T, E = TwinError> = std::result::Result<T, E>;
