//! Communication module: routes outbound envelopes and tracks acknowledgments
//!
//! Anything sent toward a device or the cloud is cached until a correlated
//! response arrives. A periodic sweep resends young entries and expires old
//! ones; an expired device request marks the device offline.

use super::{heartbeat_stops, TwinModule, COMM_MODULE, TWIN_MODULE};
use crate::context::{ModuleChannels, PendingMessage, TwinContext};
use crate::egress::{BUS, HUB};
use crate::envelope::{ops, resources, targets, Envelope};
use crate::error::{Result, TwinError};
use crate::twin::{DigitalTwin, TwinMessage, STATE_OFFLINE};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};

/// Where an envelope was routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Handed to the device transport
    Device,
    /// Handed to the cloud transport
    Cloud,
    /// Addressed to another edge application, sent through the cloud transport
    EdgePeer,
    /// Response to a message this service sent
    Response,
    /// Unrecognised target
    Dropped,
}

impl Route {
    /// Classify a target relative to this service's own name
    pub fn classify(target: &str, own_name: &str) -> Self {
        if target == targets::DEVICE {
            Self::Device
        } else if target.starts_with(targets::CLOUD_PREFIX) {
            Self::Cloud
        } else if target.starts_with(targets::EDGE_PREFIX) {
            if target == own_name {
                Self::Response
            } else {
                Self::EdgePeer
            }
        } else {
            Self::Dropped
        }
    }
}

/// Outcome of one pending-cache sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub resent: usize,
    pub expired: usize,
    pub offline_notices: usize,
    /// Expired entries kept for the next sweep because the device mailbox was full
    pub deferred: usize,
}

/// Routing and retry module
pub struct CommModule {
    ctx: Option<Arc<TwinContext>>,
    channels: Option<ModuleChannels>,
}

impl CommModule {
    pub fn new() -> Self {
        Self {
            ctx: None,
            channels: None,
        }
    }

    fn context(&self) -> Result<&Arc<TwinContext>> {
        self.ctx
            .as_ref()
            .ok_or_else(|| TwinError::NotRegistered(COMM_MODULE.to_string()))
    }

    /// Route one envelope by its target
    pub async fn route(&self, envelope: Envelope) -> Result<Route> {
        let ctx = self.context()?;
        let route = Route::classify(&envelope.target, ctx.module_name());

        match route {
            Route::Device => {
                if !envelope.is_response() {
                    ctx.cache_pending(&envelope);
                }
                tracing::debug!(id = %envelope.id, "send to device");
                ctx.send_external(BUS, envelope).await?;
            }
            Route::Cloud | Route::EdgePeer => {
                ctx.cache_pending(&envelope);
                tracing::debug!(id = %envelope.id, target = %envelope.target, "send to hub");
                ctx.send_external(HUB, envelope).await?;
            }
            Route::Response => {
                // success or failure of the request itself is the resource module's concern
                if let Some(tag) = envelope.tag.as_deref() {
                    if ctx.remove_pending(tag) {
                        tracing::debug!(tag, "pending message acknowledged");
                    }
                }
            }
            Route::Dropped => {
                tracing::warn!(%envelope, "malformed target, ignored");
            }
        }
        Ok(route)
    }

    /// Resend young pending entries and expire old ones.
    ///
    /// Never waits on a mailbox, so the loop keeps draining its own inbox.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<SweepStats> {
        let ctx = self.context()?;
        let timeout = ctx.config().message_timeout;
        let mut stats = SweepStats::default();

        for PendingMessage { envelope, sent_at } in ctx.pending_entries() {
            let age = (now - sent_at).to_std().unwrap_or_default();

            if age < timeout {
                match ctx.try_send_to_module(COMM_MODULE, envelope) {
                    Ok(()) => stats.resent += 1,
                    Err(err) => tracing::warn!(%err, "resend skipped until next sweep"),
                }
                continue;
            }

            if envelope.target == targets::DEVICE && !envelope.is_response() {
                match Self::offline_notice(ctx, &envelope) {
                    // never wait on the device mailbox: its loop may be waiting on ours
                    Ok(notice) => match ctx.try_send_to_module(TWIN_MODULE, notice) {
                        Ok(()) => stats.offline_notices += 1,
                        Err(TwinError::MailboxFull(_)) => {
                            tracing::debug!(id = %envelope.id, "device mailbox full, offline notice deferred");
                            stats.deferred += 1;
                            continue;
                        }
                        Err(err) => tracing::warn!(%err, "offline notice not delivered"),
                    },
                    Err(err) => tracing::warn!(id = %envelope.id, %err, "cannot build offline notice"),
                }
            }
            ctx.remove_pending(&envelope.id);
            stats.expired += 1;
        }

        Ok(stats)
    }

    /// Twin update marking every device in an expired envelope offline
    fn offline_notice(ctx: &TwinContext, expired: &Envelope) -> Result<Envelope> {
        let twins = TwinMessage::decode(&expired.content)?
            .twins
            .into_iter()
            .map(|twin| DigitalTwin::new(twin.id).with_state(STATE_OFFLINE))
            .collect();
        let content = TwinMessage::new(twins).encode()?;

        Ok(ctx.build_envelope(
            ctx.module_name(),
            ctx.module_name(),
            ops::UPDATE,
            resources::TWINS,
            content,
        ))
    }
}

impl Default for CommModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TwinModule for CommModule {
    fn name(&self) -> &'static str {
        COMM_MODULE
    }

    fn init(&mut self, ctx: Arc<TwinContext>, channels: ModuleChannels) {
        self.ctx = Some(ctx);
        self.channels = Some(channels);
    }

    async fn start(self: Box<Self>) {
        let mut this = self;
        let (Some(ctx), Some(mut channels)) = (this.ctx.clone(), this.channels.take()) else {
            tracing::warn!(module = COMM_MODULE, "started before registration");
            return;
        };

        let period = ctx.config().sweep_interval;
        let mut sweep = tokio::time::interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = channels.inbox.recv() => {
                    let Some(envelope) = received else {
                        return;
                    };
                    if let Err(err) = this.route(envelope).await {
                        tracing::error!(%err, "routing failed, ignored");
                    }
                }
                signal = channels.heartbeat.recv() => {
                    if heartbeat_stops(&ctx, COMM_MODULE, signal) {
                        return;
                    }
                }
                _ = sweep.tick() => {
                    match this.sweep(Utc::now()) {
                        Ok(stats) if stats.expired > 0 || stats.deferred > 0 => {
                            tracing::debug!(?stats, "expired pending messages");
                        }
                        Ok(_) => {}
                        Err(err) => tracing::error!(%err, "pending sweep failed"),
                    }
                }
            }
        }
    }
}
