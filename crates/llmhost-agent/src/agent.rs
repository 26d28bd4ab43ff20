//! Core agent implementation

use crate::{AgentError, Result};
use llmhost_adapter_device::{build_inventory, InventoryBackend};
use llmhost_core::{DeviceInventory, NodeConfig};
use llmhost_router::{Router, RouterConfig};
use llmhost_scheduler::{
    HardwareAllocator, HttpProbe, IdleReaper, Launcher, ReadinessProbe, SchedulerConfig,
    ScriptLauncher, Supervisor,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// A node: one supervisor and the router in front of it
pub struct Agent {
    config: NodeConfig,
    supervisor: Supervisor,
    router: Router,
}

impl Agent {
    /// Get the agent configuration
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Bind the configured address and run until Ctrl-C or SIGTERM
    pub async fn run(self) -> Result<()> {
        let bind_addr = self.config.server.bind_addr()?;
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            AgentError::Service(format!("failed to bind {}: {}", bind_addr, e))
        })?;

        self.run_with_listener(listener, shutdown_signal()).await
    }

    /// Run on an already bound listener until `shutdown` resolves
    ///
    /// On shutdown pending starts are cancelled at once and the listener
    /// stops accepting. Draining open connections and stopping every model
    /// share one `shutdown_timeout` deadline.
    pub async fn run_with_listener<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Agent {
            config,
            supervisor,
            router,
        } = self;
        let shutdown_timeout = Duration::from_secs(config.scheduler.shutdown_timeout_seconds);

        info!(
            address = %listener.local_addr()?,
            models = supervisor.catalog().len(),
            "Starting llmhost agent"
        );

        let reaper = IdleReaper::new(supervisor.clone()).spawn();

        let auto_started = supervisor.start_auto_models();
        if auto_started > 0 {
            info!(count = auto_started, "Starting auto-start models");
        }

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let mut server = tokio::spawn(async move {
            router
                .serve_listener(listener, async move {
                    let _ = stop_rx.await;
                })
                .await
        });

        let finished_early = tokio::select! {
            _ = shutdown => None,
            joined = &mut server => Some(joined),
        };

        let deadline = Instant::now() + shutdown_timeout;
        let served = match finished_early {
            Some(joined) => {
                error!("HTTP server exited before shutdown was requested");
                joined
            }
            None => {
                info!("Shutdown requested, draining connections");
                // pending cold starts fail before the drain begins
                supervisor.cancellation_token().cancel();
                let _ = stop_tx.send(());
                match tokio::time::timeout_at(deadline, &mut server).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!("Connections did not drain within {:?}", shutdown_timeout);
                        server.abort();
                        Ok(Ok(()))
                    }
                }
            }
        };

        supervisor.shutdown_until(deadline).await;
        if let Err(e) = reaper.await {
            warn!("Idle reaper task failed: {}", e);
        }

        info!("llmhost agent stopped");
        served.map_err(|e| AgentError::Service(format!("server task failed: {}", e)))??;
        Ok(())
    }
}

/// Builder for creating agents
///
/// Inventory, launcher and probe default to the ones the configuration
/// selects; tests swap in mocks.
#[derive(Default)]
pub struct AgentBuilder {
    config: Option<NodeConfig>,
    inventory: Option<Arc<dyn DeviceInventory>>,
    launcher: Option<Arc<dyn Launcher>>,
    probe: Option<Arc<dyn ReadinessProbe>>,
}

impl AgentBuilder {
    /// Create a new agent builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the agent configuration
    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_inventory(mut self, inventory: Arc<dyn DeviceInventory>) -> Self {
        self.inventory = Some(inventory);
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Build the agent
    pub fn build(self) -> Result<Agent> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let catalog = Arc::new(config.catalog()?);
        let inventory = self.inventory.unwrap_or_else(|| {
            build_inventory(InventoryBackend::select(&config.devices, &catalog))
        });

        let scheduler = SchedulerConfig::from(&config.scheduler);
        let launcher = self
            .launcher
            .unwrap_or_else(|| Arc::new(ScriptLauncher));
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(HttpProbe::new(&scheduler.probe)));

        let supervisor = Supervisor::new(
            catalog,
            HardwareAllocator::new(inventory),
            launcher,
            probe,
            scheduler,
        );
        let router = Router::new(RouterConfig::from(&config.server), supervisor.clone())?;

        Ok(Agent {
            config,
            supervisor,
            router,
        })
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix
pub async fn shutdown_signal() {
    tokio::select! {
        _ = ctrl_c() => info!("Received Ctrl+C signal"),
        _ = wait_for_termination() => info!("Received termination signal"),
    }
}

async fn ctrl_c() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    std::future::pending::<()>().await;
}
