//! Process-wide twin context shared by every module
//!
//! Holds the twin registry, the per-device lock table, the pending-message
//! cache, module health and the mailbox registry. One context is created per
//! process and handed to modules as an `Arc` at registration time.

use crate::egress::Egress;
use crate::envelope::{ops, targets, Envelope};
use crate::error::{Result, TwinError};
use crate::module::{TwinModule, COMM_MODULE};
use crate::twin::{DigitalTwin, TwinMessage};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Configuration for the twin context
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Name this service uses as source, and recognises as a response target
    pub module_name: String,

    /// Slots in each module's inbound mailbox
    pub mailbox_capacity: usize,

    /// Slots in each module's heartbeat mailbox
    pub heartbeat_capacity: usize,

    /// Age after which a pending message is expired instead of resent
    pub message_timeout: Duration,

    /// How often the communication module sweeps the pending cache
    pub sweep_interval: Duration,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            module_name: "edge/dgtwin".to_string(),
            mailbox_capacity: 128,
            heartbeat_capacity: 128,
            message_timeout: Duration::from_secs(180),
            sweep_interval: Duration::from_secs(60), // Check every minute
        }
    }
}

/// Signal delivered on a module's heartbeat mailbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Heartbeat {
    Ping,
    Stop,
    Other(String),
}

impl From<&str> for Heartbeat {
    fn from(signal: &str) -> Self {
        match signal {
            "ping" => Self::Ping,
            "stop" => Self::Stop,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Receiving ends handed to a module at registration
pub struct ModuleChannels {
    pub inbox: mpsc::Receiver<Envelope>,
    pub heartbeat: mpsc::Receiver<Heartbeat>,
    /// Shared confirmation channel, reserved for cross-module handshakes
    pub confirm: broadcast::Sender<Envelope>,
}

/// Sending ends kept by the context for one registered module
struct ModuleMailbox {
    inbox: mpsc::Sender<Envelope>,
    heartbeat: mpsc::Sender<Heartbeat>,
}

/// Outbound envelope awaiting acknowledgment
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub envelope: Envelope,
    pub sent_at: DateTime<Utc>,
}

/// Shared state of the twin service
pub struct TwinContext {
    config: ContextConfig,
    twins: DashMap<String, DigitalTwin>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    pending: DashMap<String, PendingMessage>,
    health: DashMap<String, i64>,
    mailboxes: DashMap<String, ModuleMailbox>,
    egress: DashMap<String, Arc<dyn Egress>>,
    confirm: broadcast::Sender<Envelope>,
}

impl TwinContext {
    /// Create an empty context
    pub fn new(config: ContextConfig) -> Arc<Self> {
        let (confirm, _) = broadcast::channel(config.mailbox_capacity.max(1));
        Arc::new(Self {
            config,
            twins: DashMap::new(),
            locks: DashMap::new(),
            pending: DashMap::new(),
            health: DashMap::new(),
            mailboxes: DashMap::new(),
            egress: DashMap::new(),
            confirm,
        })
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Name of this service as seen by peers
    pub fn module_name(&self) -> &str {
        &self.config.module_name
    }

    // ---- module wiring ----

    /// Give a module its mailboxes and a handle to this context
    pub fn register_module(self: &Arc<Self>, module: &mut dyn TwinModule) -> Result<()> {
        let name = module.name();
        let (inbox_tx, inbox_rx) = mpsc::channel(self.config.mailbox_capacity);
        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(self.config.heartbeat_capacity);

        match self.mailboxes.entry(name.to_string()) {
            Entry::Occupied(_) => return Err(TwinError::ModuleAlreadyRegistered(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(ModuleMailbox {
                    inbox: inbox_tx,
                    heartbeat: heartbeat_tx,
                });
            }
        }

        module.init(
            Arc::clone(self),
            ModuleChannels {
                inbox: inbox_rx,
                heartbeat: heartbeat_rx,
                confirm: self.confirm.clone(),
            },
        );
        tracing::debug!(module = name, "registered module");
        Ok(())
    }

    /// Names of all registered modules
    pub fn registered_modules(&self) -> Vec<String> {
        self.mailboxes.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Queue an envelope on a module's mailbox, waiting while it is full
    pub async fn send_to_module(&self, name: &str, envelope: Envelope) -> Result<()> {
        let tx = self
            .mailboxes
            .get(name)
            .map(|mailbox| mailbox.inbox.clone())
            .ok_or_else(|| TwinError::ModuleNotFound(name.to_string()))?;

        tx.send(envelope)
            .await
            .map_err(|_| TwinError::MailboxClosed(name.to_string()))
    }

    /// Queue an envelope without waiting; fails with `MailboxFull` at capacity
    pub fn try_send_to_module(&self, name: &str, envelope: Envelope) -> Result<()> {
        let mailbox = self
            .mailboxes
            .get(name)
            .ok_or_else(|| TwinError::ModuleNotFound(name.to_string()))?;

        mailbox.inbox.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TwinError::MailboxFull(name.to_string()),
            mpsc::error::TrySendError::Closed(_) => TwinError::MailboxClosed(name.to_string()),
        })
    }

    /// Deliver a heartbeat signal to a module
    pub async fn send_heartbeat(&self, name: &str, signal: Heartbeat) -> Result<()> {
        let tx = self
            .mailboxes
            .get(name)
            .map(|mailbox| mailbox.heartbeat.clone())
            .ok_or_else(|| TwinError::ModuleNotFound(name.to_string()))?;

        tx.send(signal)
            .await
            .map_err(|_| TwinError::MailboxClosed(name.to_string()))
    }

    /// Record a ping or report a stop request.
    ///
    /// Returns [`TwinError::Stopped`] on `Stop`; the caller's loop must exit.
    pub fn handle_heartbeat(&self, name: &str, signal: &Heartbeat) -> Result<()> {
        match signal {
            Heartbeat::Ping => {
                let now = Utc::now().timestamp();
                self.health.insert(name.to_string(), now);
                tracing::debug!(module = name, at = now, "module is healthy");
                Ok(())
            }
            Heartbeat::Stop => {
                tracing::info!(module = name, "module stop requested");
                Err(TwinError::Stopped)
            }
            Heartbeat::Other(_) => Ok(()),
        }
    }

    /// Last heartbeat of a module, in seconds since the epoch
    pub fn module_health(&self, name: &str) -> Option<i64> {
        self.health.get(name).map(|at| *at)
    }

    pub fn health_snapshot(&self) -> BTreeMap<String, i64> {
        self.health
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    // ---- external egress ----

    /// Register a transport under a name such as `"bus"` or `"hub"`
    pub fn register_egress(&self, name: impl Into<String>, egress: Arc<dyn Egress>) {
        self.egress.insert(name.into(), egress);
    }

    /// Hand an envelope straight to a transport.
    ///
    /// Does not touch the pending cache.
    pub async fn send_external(&self, name: &str, envelope: Envelope) -> Result<()> {
        let egress = self
            .egress
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| TwinError::ModuleNotFound(name.to_string()))?;

        egress.deliver(envelope).await;
        Ok(())
    }

    // ---- twin registry and device locks ----

    pub fn twin_exists(&self, id: &str) -> bool {
        self.twins.contains_key(id)
    }

    pub fn has_lock(&self, id: &str) -> bool {
        self.locks.contains_key(id)
    }

    pub fn twin_count(&self) -> usize {
        self.twins.len()
    }

    /// Snapshot of a stored twin
    pub fn twin(&self, id: &str) -> Result<Option<DigitalTwin>> {
        match self.twins.get(id) {
            Some(twin) if twin.id != id => Err(TwinError::InvalidTwinType(id.to_string())),
            Some(twin) => Ok(Some(twin.clone())),
            None => Ok(None),
        }
    }

    /// Insert a twin and its lock if the ID is unknown.
    ///
    /// Returns `false` without touching anything when the ID already exists.
    pub fn create_twin(&self, twin: DigitalTwin) -> bool {
        match self.twins.entry(twin.id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                self.locks
                    .insert(twin.id.clone(), Arc::new(Mutex::new(())));
                slot.insert(twin);
                true
            }
        }
    }

    /// Run `f` while holding a device's lock.
    ///
    /// Returns `None` when no lock exists for the ID. A lock replaced while
    /// waiting (twin deleted and recreated) is released and the current one
    /// acquired instead.
    pub fn with_device_lock<R>(&self, id: &str, f: impl FnOnce() -> R) -> Option<R> {
        loop {
            let lock = self.locks.get(id).map(|l| Arc::clone(l.value()))?;
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            let current = self
                .locks
                .get(id)
                .is_some_and(|l| Arc::ptr_eq(l.value(), &lock));
            if current {
                return Some(f());
            }
            tracing::trace!(id, "device lock replaced while waiting, retrying");
        }
    }

    /// Mutate a stored twin under its device lock
    pub fn update_twin<R>(&self, id: &str, f: impl FnOnce(&mut DigitalTwin) -> R) -> Result<R> {
        self.with_device_lock(id, || {
            let mut twin = self
                .twins
                .get_mut(id)
                .ok_or_else(|| TwinError::DeviceNotFound(id.to_string()))?;
            if twin.id != id {
                return Err(TwinError::InvalidTwinType(id.to_string()));
            }
            Ok(f(&mut twin))
        })
        .unwrap_or_else(|| Err(TwinError::DeviceNotFound(id.to_string())))
    }

    /// Remove a twin and then its lock.
    ///
    /// Both go while the twin's registry entry is held, so a concurrent
    /// `create_twin` for the same ID lands after the removal completes.
    pub fn remove_twin(&self, id: &str) -> Option<DigitalTwin> {
        self.with_device_lock(id, || match self.twins.entry(id.to_string()) {
            Entry::Occupied(slot) => {
                self.locks.remove(id);
                Some(slot.remove())
            }
            Entry::Vacant(_) => None,
        })
        .flatten()
    }

    // ---- pending-message cache ----

    /// Cache an envelope under its ID if nothing is cached there yet
    pub fn cache_pending(&self, envelope: &Envelope) -> bool {
        self.insert_pending(envelope, Utc::now())
    }

    /// Cache with an explicit send time
    pub fn insert_pending(&self, envelope: &Envelope, sent_at: DateTime<Utc>) -> bool {
        match self.pending.entry(envelope.id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(PendingMessage {
                    envelope: envelope.clone(),
                    sent_at,
                });
                true
            }
        }
    }

    /// Drop a pending entry, on acknowledgment or expiry
    pub fn remove_pending(&self, id: &str) -> bool {
        self.pending.remove(id).is_some()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Copy of every pending entry
    pub fn pending_entries(&self) -> Vec<PendingMessage> {
        self.pending.iter().map(|entry| entry.value().clone()).collect()
    }

    // ---- envelope helpers ----

    /// Fresh envelope stamped with a new ID and the current time
    pub fn build_envelope(
        &self,
        source: &str,
        target: &str,
        operation: &str,
        resource: &str,
        content: Vec<u8>,
    ) -> Envelope {
        Envelope::new(source, target, operation, resource, content)
    }

    /// Response to `original`, routed back to its source
    pub fn build_response(&self, original: &Envelope, content: Vec<u8>) -> Envelope {
        self.build_envelope(
            self.module_name(),
            &original.source,
            ops::RESPONSE,
            &original.resource,
            content,
        )
        .with_tag(original.id.clone())
    }

    /// Build a response and queue it on the communication module
    pub async fn send_response(&self, original: &Envelope, content: Vec<u8>) -> Result<()> {
        let response = self.build_response(original, content);
        self.send_to_module(COMM_MODULE, response).await
    }

    /// Device-bound envelope carrying a twin batch
    pub fn build_device_message(
        &self,
        operation: &str,
        resource: &str,
        twins: Vec<DigitalTwin>,
    ) -> Result<Envelope> {
        let content = TwinMessage::new(twins).encode()?;
        Ok(self.build_envelope(
            self.module_name(),
            targets::DEVICE,
            operation,
            resource,
            content,
        ))
    }

    /// Tell the devices about a twin change through the communication module
    pub async fn send_twin_to_device(
        &self,
        operation: &str,
        resource: &str,
        twins: Vec<DigitalTwin>,
    ) -> Result<()> {
        let envelope = self.build_device_message(operation, resource, twins)?;
        self.send_to_module(COMM_MODULE, envelope).await
    }
}
