//! Property synchronization module: desired/reported property maps
//!
//! Only `Update` does work today. `Delete`, `Get`, `Watch` and `Sync` have
//! slots in the command table and answer `NotImplemented`.

use super::{heartbeat_stops, Outbox, TwinModule, PROPERTY_MODULE};
use crate::context::{ModuleChannels, TwinContext};
use crate::envelope::{ops, Envelope};
use crate::error::{Result, TwinError};
use crate::twin::{ResponseStatus, TwinMessage};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

type PropertyHandler = fn(&PropertyModule, &Envelope, &mut Outbox<'_>) -> Result<()>;

/// Handles property-level requests
pub struct PropertyModule {
    ctx: Option<Arc<TwinContext>>,
    channels: Option<ModuleChannels>,
    commands: HashMap<&'static str, PropertyHandler>,
}

impl PropertyModule {
    pub fn new() -> Self {
        Self {
            ctx: None,
            channels: None,
            commands: HashMap::new(),
        }
    }

    fn init_command_table(&mut self) {
        self.commands.insert(ops::UPDATE, Self::handle_update);
        self.commands.insert(ops::DELETE, Self::not_implemented);
        self.commands.insert(ops::GET, Self::not_implemented);
        self.commands.insert(ops::WATCH, Self::not_implemented);
        self.commands.insert(ops::SYNC, Self::not_implemented);
    }

    fn context(&self) -> Result<&Arc<TwinContext>> {
        self.ctx
            .as_ref()
            .ok_or_else(|| TwinError::NotRegistered(PROPERTY_MODULE.to_string()))
    }

    pub async fn dispatch(&self, envelope: Envelope) -> Result<()> {
        let ctx = self.context()?;
        let handler = *self
            .commands
            .get(envelope.operation.as_str())
            .ok_or_else(|| TwinError::UnknownOperation(envelope.operation.clone()))?;

        let mut outbox = Outbox::new(ctx);
        let result = handler(self, &envelope, &mut outbox);
        outbox.flush().await;
        result
    }

    fn handle_update(&self, msg: &Envelope, out: &mut Outbox<'_>) -> Result<()> {
        let ctx = self.context()?;
        let request = TwinMessage::decode(&msg.content)?;
        if request.twins.is_empty() {
            tracing::warn!(id = %msg.id, "property update without twins");
        }

        for patch in &request.twins {
            match ctx.update_twin(&patch.id, |twin| twin.properties.merge(&patch.properties)) {
                Ok(()) => out.respond(msg, ResponseStatus::Success, request.twins.clone()),
                Err(TwinError::DeviceNotFound(_)) => {
                    out.respond(msg, ResponseStatus::NotFound, vec![patch.clone()]);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn not_implemented(&self, msg: &Envelope, _out: &mut Outbox<'_>) -> Result<()> {
        Err(TwinError::NotImplemented(msg.operation.clone()))
    }
}

impl Default for PropertyModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TwinModule for PropertyModule {
    fn name(&self) -> &'static str {
        PROPERTY_MODULE
    }

    fn init(&mut self, ctx: Arc<TwinContext>, channels: ModuleChannels) {
        self.ctx = Some(ctx);
        self.channels = Some(channels);
        self.init_command_table();
    }

    async fn start(self: Box<Self>) {
        let mut this = self;
        let (Some(ctx), Some(mut channels)) = (this.ctx.clone(), this.channels.take()) else {
            tracing::warn!(module = PROPERTY_MODULE, "started before registration");
            return;
        };

        loop {
            tokio::select! {
                received = channels.inbox.recv() => {
                    let Some(envelope) = received else {
                        return;
                    };
                    let id = envelope.id.clone();
                    if let Err(err) = this.dispatch(envelope).await {
                        tracing::error!(%id, %err, "handle failed, ignored");
                    }
                }
                signal = channels.heartbeat.recv() => {
                    if heartbeat_stops(&ctx, PROPERTY_MODULE, signal) {
                        return;
                    }
                }
            }
        }
    }
}
