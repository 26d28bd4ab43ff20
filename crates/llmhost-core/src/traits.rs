//! Core traits for llmhost components
//!
//! The allocator only depends on these interfaces, so device sources can be
//! swapped for tests or different hosts.

use crate::types::DeviceInfo;
use crate::Result;
use async_trait::async_trait;

/// Source of the current device list and free memory
#[async_trait]
pub trait DeviceInventory: Send + Sync {
    /// Name of the provider, for logs
    fn name(&self) -> &str;

    /// Snapshot of every known device, including offline ones
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Online devices only
    async fn online_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self
            .list_devices()
            .await?
            .into_iter()
            .filter(|d| d.online)
            .collect())
    }
}
