//! Idle reaper service

use crate::supervisor::Supervisor;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Periodically tears down exited backends and stops idle ones
pub struct IdleReaper {
    supervisor: Supervisor,
    interval: Duration,
    cancel: CancellationToken,
}

impl IdleReaper {
    /// Create a reaper that stops when the supervisor shuts down
    pub fn new(supervisor: Supervisor) -> Self {
        Self {
            interval: supervisor.config().reaper_interval,
            cancel: supervisor.cancellation_token().child_token(),
            supervisor,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Token that stops this reaper alone
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run one cycle: exited backends first, then the idle policy
    pub fn run_once(&self) -> (usize, usize) {
        let exited = self.supervisor.reap_exited();
        let idle = self.supervisor.reap_idle();
        if exited + idle > 0 {
            info!(exited, idle, "Reaper cycle stopped models");
        }
        (exited, idle)
    }

    /// Run until cancelled
    pub async fn run(self) {
        info!(
            interval = ?self.interval,
            alive_time = ?self.supervisor.config().idle.alive_time(),
            "Starting idle reaper"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    debug!("Reaper cycle");
                    self.run_once();
                }
            }
        }

        info!("Idle reaper stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::HardwareAllocator;
    use crate::config::SchedulerConfig;
    use crate::idle::IdlePolicy;
    use crate::mock::{MockLauncher, MockProbe};
    use llmhost_adapter_device::MockInventory;
    use llmhost_core::{
        DeviceInfo, HardwareConfig, LifecycleState, ModelCatalog, ModelDefinition, ModelMode,
    };
    use std::path::PathBuf;
    use std::sync::Arc;

    fn supervisor(launcher: Arc<MockLauncher>) -> Supervisor {
        let definition = ModelDefinition {
            aliases: vec!["m".to_string()],
            mode: ModelMode::Embedding,
            port: 9001,
            auto_start: false,
            working_dir: None,
            env: Default::default(),
            hardware: vec![HardwareConfig {
                name: "gpu".to_string(),
                required_devices: ["gpu0".to_string()].into(),
                memory_mb: [("gpu0".to_string(), 2000)].into(),
                script: PathBuf::from("start.sh"),
            }],
        };
        let config = SchedulerConfig::default()
            .with_reaper_interval(Duration::from_secs(30))
            .with_idle_policy(IdlePolicy::new(
                Some(Duration::from_secs(60)),
                Duration::from_secs(300),
                0.05,
                0.5,
            ));

        Supervisor::new(
            Arc::new(ModelCatalog::new(vec![definition]).unwrap()),
            HardwareAllocator::new(Arc::new(MockInventory::new(vec![DeviceInfo::new(
                "gpu0", 8000, 8000,
            )]))),
            launcher,
            Arc::new(MockProbe::ready()),
            config,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_stops_idle_model() {
        let supervisor = supervisor(MockLauncher::new());
        supervisor.ensure_running("m").await.unwrap();

        let handle = IdleReaper::new(supervisor.clone()).spawn();

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(supervisor.state("m").unwrap(), LifecycleState::Stopped);
        assert_eq!(supervisor.allocator().reserved_on("gpu0"), 0);

        supervisor.shutdown().await;
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_picks_up_crashed_backend() {
        let launcher = MockLauncher::new();
        let supervisor = supervisor(launcher.clone());
        let _guard = supervisor.acquire("m").await.unwrap();

        let reaper = IdleReaper::new(supervisor.clone());
        launcher.last_process("m").unwrap().exit_with(None, Some(11));
        assert_eq!(reaper.run_once(), (1, 0));

        supervisor.stop("m").await.unwrap();
        let info = supervisor.info("m").unwrap();
        assert!(info.last_failure.unwrap().contains("signal 11"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_cancellation() {
        let supervisor = supervisor(MockLauncher::new());
        let reaper = IdleReaper::new(supervisor.clone()).with_interval(Duration::from_secs(1));
        let cancel = reaper.cancellation_token();
        let handle = reaper.spawn();

        cancel.cancel();
        handle.await.unwrap();
        assert!(!supervisor.is_shutting_down());
    }
}
