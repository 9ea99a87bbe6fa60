//! External-facing transports the communication module hands envelopes to
//!
//! Delivery is fire-and-forget: transports fail silently and the service only
//! learns about lost messages through the pending-cache timeout sweep.

use crate::envelope::Envelope;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Egress name of the device-facing transport
pub const BUS: &str = "bus";

/// Egress name of the cloud-facing transport
pub const HUB: &str = "hub";

/// Transport trait for different egress backends
#[async_trait]
pub trait Egress: Send + Sync {
    /// Hand an envelope to the transport
    async fn deliver(&self, envelope: Envelope);
}

/// Egress that forwards into a channel read by the host transport
#[derive(Debug, Clone)]
pub struct ChannelEgress {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ChannelEgress {
    /// Create an egress and the receiver the transport drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Egress for ChannelEgress {
    async fn deliver(&self, envelope: Envelope) {
        if self.tx.send(envelope).is_err() {
            tracing::debug!("egress receiver dropped, envelope discarded");
        }
    }
}
