//! Device inventory configuration

use llmhost_core::{DevicesConfig, ModelCatalog, StaticDevice};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Device inventory backends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InventoryBackend {
    /// Every configured device is present with unlimited memory
    Unbounded { devices: BTreeSet<String> },
    /// External executables report one device each
    Plugin { dir: PathBuf, timeout: Duration },
    /// Fixed device list from configuration
    Static { devices: Vec<StaticDevice> },
}

impl InventoryBackend {
    /// Pick the backend for a node.
    ///
    /// Precedence: `disable_monitoring`, then `plugin_dir`, then the static
    /// list. With none of them the inventory falls back to unbounded.
    pub fn select(devices: &DevicesConfig, catalog: &ModelCatalog) -> Self {
        if devices.disable_monitoring {
            return InventoryBackend::Unbounded {
                devices: catalog.referenced_devices(),
            };
        }

        if let Some(dir) = &devices.plugin_dir {
            return InventoryBackend::Plugin {
                dir: dir.clone(),
                timeout: Duration::from_secs(devices.plugin_timeout_seconds),
            };
        }

        if !devices.static_devices.is_empty() {
            return InventoryBackend::Static {
                devices: devices.static_devices.clone(),
            };
        }

        tracing::warn!(
            "No device source configured; memory requirements will not be enforced"
        );
        InventoryBackend::Unbounded {
            devices: catalog.referenced_devices(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InventoryBackend::Unbounded { .. } => "unbounded",
            InventoryBackend::Plugin { .. } => "plugin",
            InventoryBackend::Static { .. } => "static",
        }
    }
}

impl fmt::Display for InventoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}
