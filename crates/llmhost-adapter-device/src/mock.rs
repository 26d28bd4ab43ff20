//! Mock device inventory for testing

use async_trait::async_trait;
use llmhost_core::{DeviceInfo, DeviceInventory, Error};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Settable inventory; clones share the same device list
#[derive(Debug, Clone, Default)]
pub struct MockInventory {
    devices: Arc<RwLock<Vec<DeviceInfo>>>,
    queries: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
}

impl MockInventory {
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self {
            devices: Arc::new(RwLock::new(devices)),
            ..Default::default()
        }
    }

    /// Two 8 GB GPUs and a CPU
    pub fn with_defaults() -> Self {
        Self::new(vec![
            DeviceInfo::new("gpu0", 8192, 8192).with_device_type("GPU"),
            DeviceInfo::new("gpu1", 8192, 8192).with_device_type("GPU"),
            DeviceInfo::new("CPU", 65536, 65536).with_device_type("CPU"),
        ])
    }

    pub async fn set_devices(&self, devices: Vec<DeviceInfo>) {
        *self.devices.write().await = devices;
    }

    pub async fn set_free_memory(&self, id: &str, free_memory_mb: u64) {
        if let Some(device) = self.devices.write().await.iter_mut().find(|d| d.id == id) {
            device.free_memory_mb = free_memory_mb;
        }
    }

    pub async fn set_online(&self, id: &str, online: bool) {
        if let Some(device) = self.devices.write().await.iter_mut().find(|d| d.id == id) {
            device.online = online;
        }
    }

    /// Make subsequent queries fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of `list_devices` calls so far
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceInventory for MockInventory {
    fn name(&self) -> &str {
        "mock"
    }

    async fn list_devices(&self) -> llmhost_core::Result<Vec<DeviceInfo>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::internal("mock inventory unavailable"));
        }
        let devices = self.devices.read().await.clone();
        debug!("Mock inventory reporting {} devices", devices.len());
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_defaults() {
        let inventory = MockInventory::with_defaults();
        let devices = inventory.list_devices().await.unwrap();
        assert_eq!(devices.len(), 3);
        assert_eq!(inventory.query_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_mutation_is_shared() {
        let inventory = MockInventory::with_defaults();
        let handle = inventory.clone();

        handle.set_free_memory("gpu0", 100).await;
        handle.set_online("gpu1", false).await;

        let online = inventory.online_devices().await.unwrap();
        assert_eq!(online.len(), 2);
        assert_eq!(online[0].free_memory_mb, 100);
    }

    #[tokio::test]
    async fn test_mock_failure() {
        let inventory = MockInventory::with_defaults();
        inventory.set_failing(true);
        assert!(inventory.list_devices().await.is_err());
    }
}
