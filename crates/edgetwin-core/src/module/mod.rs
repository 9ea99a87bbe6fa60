//! Processing modules of the twin service
//!
//! Each module owns a mailbox and runs one loop; state lives in the shared
//! [`TwinContext`]. Handlers are synchronous and queue their outgoing
//! envelopes on an [`Outbox`], which the loop flushes after the handler
//! returns so no device lock is ever held across an `.await`.

pub mod comm;
pub mod device;
pub mod property;

pub use comm::CommModule;
pub use device::DeviceModule;
pub use property::PropertyModule;

use crate::context::{Heartbeat, ModuleChannels, TwinContext};
use crate::envelope::Envelope;
use crate::error::Result;
use crate::twin::{DigitalTwin, ResponseStatus, TwinResponse};
use async_trait::async_trait;
use std::sync::Arc;

/// Name of the communication/routing module
pub const COMM_MODULE: &str = "comm";

/// Name of the device lifecycle module
pub const TWIN_MODULE: &str = "twins";

/// Name of the property synchronization module
pub const PROPERTY_MODULE: &str = "property";

/// Capability set shared by all processing modules
#[async_trait]
pub trait TwinModule: Send {
    /// Name the module's mailbox is registered under
    fn name(&self) -> &'static str;

    /// Called once by [`TwinContext::register_module`]
    fn init(&mut self, ctx: Arc<TwinContext>, channels: ModuleChannels);

    /// Run the processing loop until a stop heartbeat or closed mailbox
    async fn start(self: Box<Self>);
}

/// Apply a heartbeat signal; `true` means the loop must exit
pub(crate) fn heartbeat_stops(ctx: &TwinContext, name: &str, signal: Option<Heartbeat>) -> bool {
    let Some(signal) = signal else {
        return true;
    };
    if ctx.handle_heartbeat(name, &signal).is_err() {
        tracing::info!(module = name, "module stopped");
        return true;
    }
    false
}

/// Encode a response body, falling back to an internal-error body
pub(crate) fn response_body(status: ResponseStatus, twins: Vec<DigitalTwin>) -> Vec<u8> {
    TwinResponse::new(status, twins).encode().unwrap_or_else(|err| {
        tracing::error!(%err, "failed to encode response");
        TwinResponse::new(ResponseStatus::InternalError, Vec::new())
            .encode()
            .unwrap_or_default()
    })
}

/// Envelopes produced by a handler, delivered in order once it returns
pub(crate) struct Outbox<'a> {
    ctx: &'a TwinContext,
    queued: Vec<(&'static str, Envelope)>,
}

impl<'a> Outbox<'a> {
    pub(crate) fn new(ctx: &'a TwinContext) -> Self {
        Self {
            ctx,
            queued: Vec::new(),
        }
    }

    /// Queue an envelope for another module
    pub(crate) fn push(&mut self, module: &'static str, envelope: Envelope) {
        self.queued.push((module, envelope));
    }

    /// Queue a response to `original` on the communication module
    pub(crate) fn respond(&mut self, original: &Envelope, status: ResponseStatus, twins: Vec<DigitalTwin>) {
        let response = self.ctx.build_response(original, response_body(status, twins));
        self.push(COMM_MODULE, response);
    }

    /// Queue a device-bound twin notice on the communication module
    pub(crate) fn notify_device(&mut self, operation: &str, resource: &str, twins: Vec<DigitalTwin>) -> Result<()> {
        let envelope = self.ctx.build_device_message(operation, resource, twins)?;
        self.push(COMM_MODULE, envelope);
        Ok(())
    }

    /// Deliver everything queued, logging undeliverable envelopes
    pub(crate) async fn flush(self) {
        for (module, envelope) in self.queued {
            if let Err(err) = self.ctx.send_to_module(module, envelope).await {
                tracing::warn!(module, %err, "dropping envelope");
            }
        }
    }
}
