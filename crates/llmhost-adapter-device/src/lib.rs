//! # llmhost-adapter-device
//!
//! Device inventory providers for llmhost.
//!
//! This crate answers one question for the allocator: which devices exist
//! right now and how much memory is free on each. Providers:
//!
//! - **Plugin**: executables in a directory, each reporting one device
//! - **Static**: a fixed list from configuration
//! - **Unbounded**: every configured device with unlimited memory, used when
//!   monitoring is disabled
//! - **Mock**: settable inventory for tests (feature `mock`)
//!
//! ## Example
//!
//! ```rust,no_run
//! use llmhost_adapter_device::{build_inventory, InventoryBackend};
//! use llmhost_core::NodeConfig;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = NodeConfig::load(None)?;
//! let catalog = config.catalog()?;
//! let inventory = build_inventory(InventoryBackend::select(&config.devices, &catalog));
//!
//! for device in inventory.online_devices().await? {
//!     println!("{}: {} MB free", device.id, device.free_memory_mb);
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod config;
pub mod plugin;
pub mod static_inventory;

// Mock implementation for testing
#[cfg(any(feature = "mock", test))]
pub mod mock;

// Re-export main types
pub use config::InventoryBackend;
pub use llmhost_core::DeviceInventory;
pub use plugin::{PluginInventory, PluginReport};
pub use static_inventory::{StaticInventory, UnboundedInventory, UNBOUNDED_MEMORY_MB};

#[cfg(any(feature = "mock", test))]
pub use mock::MockInventory;

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Errors that can occur while querying devices
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Plugin {plugin} failed: {reason}")]
    PluginFailed { plugin: String, reason: String },

    #[error("Plugin {plugin} timed out after {timeout:?}")]
    PluginTimeout { plugin: String, timeout: Duration },

    #[error("Plugin {plugin} printed an invalid report: {reason}")]
    InvalidReport { plugin: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeviceError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeviceError::PluginTimeout { .. } | DeviceError::PluginFailed { .. }
        )
    }

    /// Check if this error points at a broken plugin rather than the host
    pub fn is_plugin_issue(&self) -> bool {
        matches!(
            self,
            DeviceError::PluginFailed { .. }
                | DeviceError::PluginTimeout { .. }
                | DeviceError::InvalidReport { .. }
        )
    }
}

impl From<DeviceError> for llmhost_core::Error {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Configuration(msg) => llmhost_core::Error::config(msg),
            DeviceError::Io(e) => llmhost_core::Error::Io(e),
            other => llmhost_core::Error::internal(other.to_string()),
        }
    }
}

/// Create the inventory for a selected backend
pub fn build_inventory(backend: InventoryBackend) -> Arc<dyn DeviceInventory> {
    tracing::info!("Using {} device inventory", backend);

    match backend {
        InventoryBackend::Unbounded { devices } => Arc::new(UnboundedInventory::new(devices)),
        InventoryBackend::Plugin { dir, timeout } => Arc::new(PluginInventory::new(dir, timeout)),
        InventoryBackend::Static { devices } => Arc::new(StaticInventory::new(&devices)),
    }
}
