//! Shared helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use edgetwin_core::envelope::{resources, Envelope};
use edgetwin_core::{DigitalTwin, ModuleChannels, TwinContext, TwinMessage, TwinModule, TwinResponse};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Source used for requests coming from the cloud side
pub const CLOUD_APP: &str = "cloud/app";

/// Stand-in module that only exposes its inbox
struct Probe {
    name: &'static str,
    channels: Option<ModuleChannels>,
}

#[async_trait]
impl TwinModule for Probe {
    fn name(&self) -> &'static str {
        self.name
    }

    fn init(&mut self, _ctx: Arc<TwinContext>, channels: ModuleChannels) {
        self.channels = Some(channels);
    }

    async fn start(self: Box<Self>) {}
}

/// Register a probe under `name` and return its inbox
pub fn probe(ctx: &Arc<TwinContext>, name: &'static str) -> mpsc::Receiver<Envelope> {
    let mut probe = Probe {
        name,
        channels: None,
    };
    ctx.register_module(&mut probe).unwrap();
    probe.channels.take().unwrap().inbox
}

/// Request from the cloud app to this service
pub fn request(ctx: &TwinContext, operation: &str, twins: Vec<DigitalTwin>) -> Envelope {
    let content = TwinMessage::new(twins).encode().unwrap();
    ctx.build_envelope(CLOUD_APP, ctx.module_name(), operation, resources::TWINS, content)
}

/// Decode a response envelope's body
pub fn response(envelope: &Envelope) -> TwinResponse {
    TwinResponse::decode(&envelope.content).unwrap()
}

/// Decode an envelope carrying a twin batch
pub fn twins(envelope: &Envelope) -> Vec<DigitalTwin> {
    TwinMessage::decode(&envelope.content).unwrap().twins
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
