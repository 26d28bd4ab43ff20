//! Inventories that never query the host

use async_trait::async_trait;
use llmhost_core::{DeviceInfo, DeviceInventory, StaticDevice};
use std::collections::BTreeSet;
use tracing::debug;

/// Memory reported for devices when monitoring is disabled
pub const UNBOUNDED_MEMORY_MB: u64 = u64::MAX / 4;

/// Fixed device list taken from configuration
#[derive(Debug, Clone)]
pub struct StaticInventory {
    devices: Vec<DeviceInfo>,
}

impl StaticInventory {
    pub fn new(devices: &[StaticDevice]) -> Self {
        let devices = devices
            .iter()
            .map(|d| {
                DeviceInfo::new(
                    d.id.clone(),
                    d.total_memory_mb,
                    d.free_memory_mb.unwrap_or(d.total_memory_mb),
                )
            })
            .collect();
        Self { devices }
    }
}

#[async_trait]
impl DeviceInventory for StaticInventory {
    fn name(&self) -> &str {
        "static"
    }

    async fn list_devices(&self) -> llmhost_core::Result<Vec<DeviceInfo>> {
        debug!("Reporting {} static devices", self.devices.len());
        Ok(self.devices.clone())
    }
}

/// Reports every named device online with unlimited memory, so only device
/// presence is checked
#[derive(Debug, Clone)]
pub struct UnboundedInventory {
    devices: BTreeSet<String>,
}

impl UnboundedInventory {
    pub fn new(devices: BTreeSet<String>) -> Self {
        Self { devices }
    }
}

#[async_trait]
impl DeviceInventory for UnboundedInventory {
    fn name(&self) -> &str {
        "unbounded"
    }

    async fn list_devices(&self) -> llmhost_core::Result<Vec<DeviceInfo>> {
        Ok(self
            .devices
            .iter()
            .map(|id| {
                DeviceInfo::new(id.clone(), UNBOUNDED_MEMORY_MB, UNBOUNDED_MEMORY_MB)
                    .with_device_type("unmonitored")
            })
            .collect())
    }
}
