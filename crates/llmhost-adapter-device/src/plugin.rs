//! Device plugins
//!
//! A plugin is an executable in the plugin directory. It is run with the
//! single argument `info` and must print one JSON object describing its
//! device on stdout:
//!
//! ```json
//! {"device": "rtx 4060", "online": true, "total_memory_mb": 16376,
//!  "available_memory_mb": 15200, "device_type": "GPU"}
//! ```

use crate::{DeviceError, Result};
use async_trait::async_trait;
use llmhost_core::{DeviceInfo, DeviceInventory};
use serde::Deserialize;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// What a plugin prints
#[derive(Debug, Clone, Deserialize)]
pub struct PluginReport {
    pub device: String,
    #[serde(default = "default_online")]
    pub online: bool,
    pub total_memory_mb: u64,
    pub available_memory_mb: u64,
    #[serde(default)]
    pub used_memory_mb: Option<u64>,
    #[serde(default)]
    pub usage_percentage: Option<f64>,
    #[serde(default)]
    pub temperature_celsius: Option<f64>,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub memory_type: Option<String>,
}

fn default_online() -> bool {
    true
}

impl From<PluginReport> for DeviceInfo {
    fn from(report: PluginReport) -> Self {
        DeviceInfo {
            id: report.device,
            online: report.online,
            total_memory_mb: report.total_memory_mb,
            free_memory_mb: report.available_memory_mb.min(report.total_memory_mb),
            device_type: report.device_type,
            memory_type: report.memory_type,
            usage_percentage: report.usage_percentage,
            temperature_celsius: report.temperature_celsius,
        }
    }
}

/// Inventory backed by a directory of device plugins
#[derive(Debug, Clone)]
pub struct PluginInventory {
    dir: PathBuf,
    timeout: Duration,
}

impl PluginInventory {
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            timeout,
        }
    }

    /// Executable, non-hidden files in the plugin directory, sorted by name
    pub fn discover(&self) -> Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            DeviceError::Configuration(format!(
                "cannot read plugin directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let mut plugins = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();

            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(true, |n| n.starts_with('.'));
            if hidden {
                continue;
            }

            let metadata = entry.metadata()?;
            if metadata.is_file() && metadata.permissions().mode() & 0o111 != 0 {
                plugins.push(path);
            }
        }

        plugins.sort();
        Ok(plugins)
    }

    /// Run one plugin and parse its report
    pub async fn query(&self, plugin: &Path) -> Result<PluginReport> {
        let name = plugin.display().to_string();

        let output = Command::new(plugin)
            .arg("info")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| DeviceError::PluginTimeout {
                plugin: name.clone(),
                timeout: self.timeout,
            })?
            .map_err(|e| DeviceError::PluginFailed {
                plugin: name.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(DeviceError::PluginFailed {
                plugin: name,
                reason: format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        serde_json::from_slice(&output.stdout).map_err(|e| DeviceError::InvalidReport {
            plugin: name,
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl DeviceInventory for PluginInventory {
    fn name(&self) -> &str {
        "plugin"
    }

    async fn list_devices(&self) -> llmhost_core::Result<Vec<DeviceInfo>> {
        let plugins = self.discover()?;

        let reports =
            futures::future::join_all(plugins.iter().map(|plugin| self.query(plugin))).await;

        let mut devices = Vec::with_capacity(reports.len());
        for (plugin, report) in plugins.iter().zip(reports) {
            match report {
                Ok(report) if report.online => {
                    debug!(
                        plugin = %plugin.display(),
                        device = %report.device,
                        available_mb = report.available_memory_mb,
                        "Device plugin reported"
                    );
                    devices.push(DeviceInfo::from(report));
                }
                Ok(report) => {
                    debug!(device = %report.device, "Device plugin reports device offline");
                }
                Err(e) => {
                    warn!(plugin = %plugin.display(), "Skipping device plugin: {}", e);
                }
            }
        }

        Ok(devices)
    }
}
