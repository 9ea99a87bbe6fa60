//! Device lifecycle module: create, update, delete and get whole twins

use super::{heartbeat_stops, Outbox, TwinModule, PROPERTY_MODULE, TWIN_MODULE};
use crate::context::{ModuleChannels, TwinContext};
use crate::envelope::{ops, resources, Envelope};
use crate::error::{Result, TwinError};
use crate::twin::{ResponseStatus, TwinMessage};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

type DeviceHandler = fn(&DeviceModule, &Envelope, &mut Outbox<'_>) -> Result<()>;

/// Handles whole-twin requests
pub struct DeviceModule {
    ctx: Option<Arc<TwinContext>>,
    channels: Option<ModuleChannels>,
    commands: HashMap<&'static str, DeviceHandler>,
}

impl DeviceModule {
    pub fn new() -> Self {
        Self {
            ctx: None,
            channels: None,
            commands: HashMap::new(),
        }
    }

    fn init_command_table(&mut self) {
        self.commands.insert(ops::UPDATE, Self::handle_update);
        self.commands.insert(ops::DELETE, Self::handle_delete);
        self.commands.insert(ops::GET, Self::handle_get);
    }

    fn context(&self) -> Result<&Arc<TwinContext>> {
        self.ctx
            .as_ref()
            .ok_or_else(|| TwinError::NotRegistered(TWIN_MODULE.to_string()))
    }

    /// Run the handler registered for the envelope's operation.
    ///
    /// Envelopes queued before a handler error are still delivered.
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

    /// Create unknown twins, merge-patch known ones
    fn handle_update(&self, msg: &Envelope, out: &mut Outbox<'_>) -> Result<()> {
        let ctx = self.context()?;
        let request = TwinMessage::decode(&msg.content)?;
        let internal = msg.source == ctx.module_name();

        for patch in request.twins {
            if !ctx.twin_exists(&patch.id) {
                if internal {
                    // internal notices (e.g. offline marking) never create twins
                    tracing::debug!(id = %patch.id, "internal update for unknown twin, ignored");
                    continue;
                }
                if ctx.create_twin(patch.clone()) {
                    tracing::info!(id = %patch.id, "created twin");
                    out.respond(msg, ResponseStatus::Success, Vec::new());
                    // a reply from the device is the liveness signal
                    out.notify_device(ops::CREATE, resources::DEVICE, vec![patch])?;
                    continue;
                }
            }

            match ctx.update_twin(&patch.id, |twin| twin.apply_patch(&patch)) {
                Ok(()) => {}
                Err(TwinError::DeviceNotFound(id)) => {
                    tracing::debug!(%id, "twin removed before update");
                    if !internal {
                        out.respond(msg, ResponseStatus::NotFound, vec![patch]);
                    }
                    continue;
                }
                Err(err) => return Err(err),
            }

            if !internal {
                out.respond(msg, ResponseStatus::Success, Vec::new());
            }

            if patch.has_desired() {
                let content = TwinMessage::new(vec![patch]).encode()?;
                let forward = ctx.build_envelope(
                    ctx.module_name(),
                    ctx.module_name(),
                    ops::UPDATE,
                    resources::PROPERTY,
                    content,
                );
                out.push(PROPERTY_MODULE, forward);
            }
        }
        Ok(())
    }

    fn handle_delete(&self, msg: &Envelope, out: &mut Outbox<'_>) -> Result<()> {
        let ctx = self.context()?;
        let request = TwinMessage::decode(&msg.content)?;

        for record in request.twins {
            if ctx.remove_twin(&record.id).is_some() {
                tracing::info!(id = %record.id, "deleted twin");
                out.respond(msg, ResponseStatus::Deleted, vec![record.clone()]);
                out.notify_device(ops::DELETE, resources::DEVICE, vec![record])?;
            } else {
                out.respond(msg, ResponseStatus::NotFound, vec![record]);
            }
        }
        Ok(())
    }

    /// All-or-nothing batch read
    fn handle_get(&self, msg: &Envelope, out: &mut Outbox<'_>) -> Result<()> {
        let ctx = self.context()?;
        let request = TwinMessage::decode(&msg.content)?;
        let mut found = Vec::with_capacity(request.twins.len());

        for record in request.twins {
            match ctx.twin(&record.id)? {
                Some(twin) => found.push(twin),
                None => {
                    out.respond(msg, ResponseStatus::NotFound, vec![record]);
                    return Ok(());
                }
            }
        }

        out.respond(msg, ResponseStatus::Success, found);
        Ok(())
    }
}

impl Default for DeviceModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TwinModule for DeviceModule {
    fn name(&self) -> &'static str {
        TWIN_MODULE
    }

    fn init(&mut self, ctx: Arc<TwinContext>, channels: ModuleChannels) {
        self.ctx = Some(ctx);
        self.channels = Some(channels);
        self.init_command_table();
    }

    async fn start(self: Box<Self>) {
        let mut this = self;
        let (Some(ctx), Some(mut channels)) = (this.ctx.clone(), this.channels.take()) else {
            tracing::warn!(module = TWIN_MODULE, "started before registration");
            return;
        };

        loop {
            tokio::select! {
                received = channels.inbox.recv() => {
                    let Some(envelope) = received else {
                        return;
                    };
                    tracing::debug!(%envelope, "device module received message");
                    let operation = envelope.operation.clone();
                    if let Err(err) = this.dispatch(envelope).await {
                        tracing::error!(%operation, %err, "handle failed, ignored");
                    }
                }
                signal = channels.heartbeat.recv() => {
                    if heartbeat_stops(&ctx, TWIN_MODULE, signal) {
                        return;
                    }
                }
            }
        }
    }
}
