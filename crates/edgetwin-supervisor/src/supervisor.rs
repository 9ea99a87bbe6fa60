//! Supervisor that owns the module loops of one twin context

use anyhow::{bail, Context, Result};
use edgetwin_core::{CommModule, DeviceModule, Heartbeat, PropertyModule, TwinContext, TwinModule};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for the supervisor
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How often every registered module is pinged
    pub heartbeat_interval: Duration,

    /// How long a module may take to exit after a stop signal
    pub shutdown_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// A spawned module loop
struct Child {
    name: &'static str,
    handle: JoinHandle<()>,
}

/// Registers modules, drives their heartbeats and stops them
pub struct Supervisor {
    ctx: Arc<TwinContext>,
    config: SupervisorConfig,
    children: Vec<Child>,
    heartbeat: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(ctx: Arc<TwinContext>, config: SupervisorConfig) -> Self {
        Self {
            ctx,
            config,
            children: Vec::new(),
            heartbeat: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Start the communication, device and property modules with heartbeats
    pub fn launch(ctx: Arc<TwinContext>, config: SupervisorConfig) -> Result<Self> {
        let mut supervisor = Self::new(ctx, config);
        supervisor.spawn(Box::new(CommModule::new()))?;
        supervisor.spawn(Box::new(DeviceModule::new()))?;
        supervisor.spawn(Box::new(PropertyModule::new()))?;
        supervisor.start_heartbeats();
        Ok(supervisor)
    }

    pub fn context(&self) -> &Arc<TwinContext> {
        &self.ctx
    }

    /// Register a module with the context and run its loop
    pub fn spawn(&mut self, mut module: Box<dyn TwinModule>) -> Result<()> {
        let name = module.name();
        self.ctx
            .register_module(module.as_mut())
            .with_context(|| format!("failed to register module {name}"))?;

        let handle = tokio::spawn(module.start());
        info!(module = name, "module started");
        self.children.push(Child { name, handle });
        Ok(())
    }

    /// Whether a spawned module's loop is still running
    pub fn is_running(&self, name: &str) -> bool {
        self.children
            .iter()
            .any(|child| child.name == name && !child.handle.is_finished())
    }

    /// Ping every registered module on the configured interval
    pub fn start_heartbeats(&mut self) {
        if self.heartbeat.is_some() {
            return;
        }
        let ctx = Arc::clone(&self.ctx);
        let token = self.cancel.child_token();
        let period = self.config.heartbeat_interval;

        self.heartbeat = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            'ticks: loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = interval.tick() => {
                        for name in ctx.registered_modules() {
                            // a module that stopped reading must not hold up cancellation
                            tokio::select! {
                                () = token.cancelled() => break 'ticks,
                                sent = ctx.send_heartbeat(&name, Heartbeat::Ping) => {
                                    if let Err(err) = sent {
                                        warn!(module = %name, %err, "heartbeat not delivered");
                                    }
                                }
                            }
                        }
                    }
                }
            }
            debug!("heartbeat task stopped");
        }));
    }

    /// Stop heartbeats, signal every module to stop and wait for the loops.
    ///
    /// Each module gets `shutdown_timeout` to accept its stop signal and exit;
    /// loops still running after that are aborted.
    pub async fn shutdown(mut self) -> Result<()> {
        let timeout = self.config.shutdown_timeout;

        self.cancel.cancel();
        if let Some(mut heartbeat) = self.heartbeat.take() {
            match tokio::time::timeout(timeout, &mut heartbeat).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(%err, "heartbeat task failed"),
                Err(_) => {
                    warn!("heartbeat task did not stop in time, aborting");
                    heartbeat.abort();
                }
            }
        }

        let ctx = &self.ctx;
        let waits = self.children.into_iter().map(|Child { name, mut handle }| async move {
            let stopped = tokio::time::timeout(timeout, async {
                if let Err(err) = ctx.send_heartbeat(name, Heartbeat::Stop).await {
                    warn!(module = name, %err, "stop signal not delivered");
                }
                (&mut handle).await
            })
            .await;

            match stopped {
                Ok(Ok(())) => {
                    info!(module = name, "module stopped");
                    true
                }
                Ok(Err(err)) => {
                    warn!(module = name, %err, "module loop failed");
                    false
                }
                Err(_) => {
                    warn!(module = name, "module did not stop in time, aborting");
                    handle.abort();
                    false
                }
            }
        });

        let clean = join_all(waits).await;
        let failed = clean.iter().filter(|stopped| !**stopped).count();
        if failed > 0 {
            bail!("{failed} module(s) did not stop cleanly");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgetwin_core::envelope::{ops, resources, targets};
    use edgetwin_core::egress::{BUS, HUB};
    use edgetwin_core::module::{COMM_MODULE, PROPERTY_MODULE, TWIN_MODULE};
    use edgetwin_core::{
        ChannelEgress, ContextConfig, DigitalTwin, ModuleChannels, ResponseStatus, TwinMessage, TwinResponse,
    };

    /// Module that keeps its mailboxes open but never reads them
    struct Stalled {
        channels: Option<ModuleChannels>,
    }

    #[async_trait::async_trait]
    impl TwinModule for Stalled {
        fn name(&self) -> &'static str {
            "stalled"
        }

        fn init(&mut self, _ctx: Arc<TwinContext>, channels: ModuleChannels) {
            self.channels = Some(channels);
        }

        async fn start(self: Box<Self>) {
            let _held = self.channels;
            std::future::pending::<()>().await;
        }
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    #[tokio::test]
    async fn test_launch_pings_and_stops_modules() {
        init_tracing();
        let ctx = TwinContext::new(ContextConfig::default());
        let supervisor = Supervisor::launch(
            Arc::clone(&ctx),
            SupervisorConfig {
                heartbeat_interval: Duration::from_millis(20),
                shutdown_timeout: Duration::from_secs(1),
            },
        )
        .unwrap();

        assert!(supervisor.is_running(COMM_MODULE));
        assert!(supervisor.is_running(TWIN_MODULE));
        assert!(supervisor.is_running(PROPERTY_MODULE));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let health = ctx.health_snapshot();
        assert!(health.contains_key(COMM_MODULE));
        assert!(health.contains_key(TWIN_MODULE));
        assert!(health.contains_key(PROPERTY_MODULE));

        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_rejects_duplicate_name() {
        let ctx = TwinContext::new(ContextConfig::default());
        let mut supervisor = Supervisor::new(ctx, SupervisorConfig::default());

        supervisor.spawn(Box::new(CommModule::new())).unwrap();
        let err = supervisor.spawn(Box::new(CommModule::new())).unwrap_err();
        assert!(err.to_string().contains(COMM_MODULE));

        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_launched_service_answers_requests() {
        init_tracing();
        let ctx = TwinContext::new(ContextConfig::default());
        let (bus, mut bus_rx) = ChannelEgress::new();
        let (hub, mut hub_rx) = ChannelEgress::new();
        ctx.register_egress(BUS, Arc::new(bus));
        ctx.register_egress(HUB, Arc::new(hub));
        let supervisor = Supervisor::launch(Arc::clone(&ctx), SupervisorConfig::default()).unwrap();

        let content = TwinMessage::new(vec![DigitalTwin::new("lamp-1").with_state("online")])
            .encode()
            .unwrap();
        let req = ctx.build_envelope("cloud/console", ctx.module_name(), ops::UPDATE, resources::TWINS, content);
        ctx.send_to_module(TWIN_MODULE, req).await.unwrap();

        let resp = tokio::time::timeout(Duration::from_secs(1), hub_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.target, "cloud/console");
        let body = TwinResponse::decode(&resp.content).unwrap();
        assert_eq!(body.status, ResponseStatus::Success);

        let notice = tokio::time::timeout(Duration::from_secs(1), bus_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice.target, targets::DEVICE);

        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_aborts_module_that_never_reads() {
        init_tracing();
        let ctx = TwinContext::new(ContextConfig {
            heartbeat_capacity: 1,
            ..ContextConfig::default()
        });
        let mut supervisor = Supervisor::new(
            ctx,
            SupervisorConfig {
                heartbeat_interval: Duration::from_millis(5),
                shutdown_timeout: Duration::from_millis(200),
            },
        );
        supervisor.spawn(Box::new(Stalled { channels: None })).unwrap();
        supervisor.start_heartbeats();

        // heartbeat mailbox fills up and the next ping blocks
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(supervisor.is_running("stalled"));

        let result = tokio::time::timeout(Duration::from_secs(3), supervisor.shutdown())
            .await
            .expect("shutdown did not return");
        let err = result.unwrap_err();
        assert!(err.to_string().contains("did not stop cleanly"));
    }
}
