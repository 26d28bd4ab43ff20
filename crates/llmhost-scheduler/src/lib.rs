//! # llmhost-scheduler
//!
//! Decides when model backends run and on which hardware.
//!
//! This crate provides:
//! - A hardware allocator that reserves device memory for a launch
//! - Backend launching, readiness probing and graceful termination
//! - A supervisor that owns each model's lifecycle and coalesces
//!   concurrent starts into one launch
//! - An idle reaper with a usage-weighted idle policy
//!
//! ## Example
//!
//! ```rust,no_run
//! use llmhost_core::NodeConfig;
//! use llmhost_scheduler::{
//!     HardwareAllocator, HttpProbe, IdleReaper, SchedulerConfig, ScriptLauncher, Supervisor,
//! };
//! use std::sync::Arc;
//!
//! # async fn run(config: NodeConfig, inventory: Arc<dyn llmhost_core::DeviceInventory>) -> llmhost_core::Result<()> {
//! let scheduler = SchedulerConfig::from(&config.scheduler);
//! let supervisor = Supervisor::new(
//!     Arc::new(config.catalog()?),
//!     HardwareAllocator::new(inventory),
//!     Arc::new(ScriptLauncher),
//!     Arc::new(HttpProbe::new(&scheduler.probe)),
//!     scheduler,
//! );
//! IdleReaper::new(supervisor.clone()).spawn();
//!
//! let guard = supervisor.acquire("qwen-14b").await?;
//! println!("forwarding to port {}", guard.instance().port());
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod config;
pub mod idle;
pub mod instance;
pub mod probe;
pub mod process;
pub mod reaper;
pub mod supervisor;

#[cfg(any(feature = "mock", test))]
pub mod mock;

pub use allocator::{AllocationSnapshot, DeviceAllocation, HardwareAllocator, Lease, LeaseSummary};
pub use config::{ProbeConfig, SchedulerConfig};
pub use idle::{ActivityState, IdleDecision, IdlePolicy};
pub use instance::{ModelInstance, RequestGuard};
pub use probe::{wait_until_ready, HttpProbe, ReadinessProbe};
pub use process::{
    shutdown_process, BackendProcess, ChildProcess, ExitInfo, LaunchSpec, Launcher, ScriptLauncher,
};
pub use reaper::IdleReaper;
pub use supervisor::{ModelInfo, Supervisor, SupervisorStats};

#[cfg(any(feature = "mock", test))]
pub use mock::{MockLauncher, MockProbe, MockProcess};
