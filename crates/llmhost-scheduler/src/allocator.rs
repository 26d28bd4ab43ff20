//! Hardware allocator
//!
//! Picks the first hardware configuration of a model that fits the devices
//! reported by the inventory and reserves its memory. Reservations are
//! logical bookkeeping only and are held by a [`Lease`]; dropping the lease
//! gives the memory back.

use llmhost_core::{DeviceInfo, DeviceInventory, Error, HardwareConfig, ModelDefinition, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct ReservationTable {
    reserved: HashMap<String, u64>,
    leases: BTreeMap<u64, LeaseRecord>,
    next_id: u64,
}

#[derive(Debug, Clone)]
struct LeaseRecord {
    alias: String,
    hardware_config: String,
    grants: BTreeMap<String, u64>,
}

impl ReservationTable {
    fn reserved_on(&self, device: &str) -> u64 {
        self.reserved.get(device).copied().unwrap_or(0)
    }

    fn effective_free(&self, device: &DeviceInfo) -> u64 {
        let headroom = device
            .total_memory_mb
            .saturating_sub(self.reserved_on(&device.id));
        device.free_memory_mb.min(headroom)
    }

    /// Why `hw` does not fit, or `None` when it does
    fn misfit(&self, hw: &HardwareConfig, devices: &HashMap<&str, &DeviceInfo>) -> Option<String> {
        let mut problems = Vec::new();

        for id in &hw.required_devices {
            match devices.get(id.as_str()) {
                None => problems.push(format!("device '{}' not available", id)),
                Some(device) => {
                    let needed = hw.memory_for(id);
                    let free = self.effective_free(device);
                    if needed > free {
                        problems.push(format!(
                            "device '{}' needs {} MB, {} MB free",
                            id, needed, free
                        ));
                    }
                }
            }
        }

        if problems.is_empty() {
            None
        } else {
            Some(problems.join(", "))
        }
    }

    fn grant(&mut self, alias: &str, hw: &HardwareConfig) -> (u64, BTreeMap<String, u64>) {
        let grants: BTreeMap<String, u64> = hw
            .required_devices
            .iter()
            .map(|id| (id.clone(), hw.memory_for(id)))
            .collect();

        for (device, mb) in &grants {
            *self.reserved.entry(device.clone()).or_insert(0) += mb;
        }

        self.next_id += 1;
        let id = self.next_id;
        self.leases.insert(
            id,
            LeaseRecord {
                alias: alias.to_string(),
                hardware_config: hw.name.clone(),
                grants: grants.clone(),
            },
        );

        (id, grants)
    }

    fn release(&mut self, id: u64) {
        let Some(record) = self.leases.remove(&id) else {
            return;
        };

        for (device, mb) in &record.grants {
            if let Some(reserved) = self.reserved.get_mut(device) {
                *reserved = reserved.saturating_sub(*mb);
                if *reserved == 0 {
                    self.reserved.remove(device);
                }
            }
        }
    }
}

fn lock(table: &Mutex<ReservationTable>) -> MutexGuard<'_, ReservationTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Memory reservation for one running or starting instance
#[derive(Debug)]
pub struct Lease {
    id: u64,
    alias: String,
    hardware: HardwareConfig,
    grants: BTreeMap<String, u64>,
    table: Arc<Mutex<ReservationTable>>,
}

impl Lease {
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Hardware configuration the lease was granted for
    pub fn hardware(&self) -> &HardwareConfig {
        &self.hardware
    }

    /// Reserved MB per device
    pub fn grants(&self) -> &BTreeMap<String, u64> {
        &self.grants
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        lock(&self.table).release(self.id);
        debug!(
            alias = %self.alias,
            hardware_config = %self.hardware.name,
            "Released hardware reservation"
        );
    }
}

/// Per-device view of the reservation table
#[derive(Debug, Clone, Serialize)]
pub struct DeviceAllocation {
    pub id: String,
    pub online: bool,
    pub total_memory_mb: u64,
    pub reported_free_mb: u64,
    pub reserved_mb: u64,
    pub effective_free_mb: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_percentage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_celsius: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaseSummary {
    pub alias: String,
    pub hardware_config: String,
    pub grants_mb: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllocationSnapshot {
    pub inventory: String,
    pub devices: Vec<DeviceAllocation>,
    pub leases: Vec<LeaseSummary>,
}

/// Hardware allocator
#[derive(Clone)]
pub struct HardwareAllocator {
    inventory: Arc<dyn DeviceInventory>,
    table: Arc<Mutex<ReservationTable>>,
}

impl HardwareAllocator {
    pub fn new(inventory: Arc<dyn DeviceInventory>) -> Self {
        Self {
            inventory,
            table: Arc::new(Mutex::new(ReservationTable::default())),
        }
    }

    pub fn inventory(&self) -> &Arc<dyn DeviceInventory> {
        &self.inventory
    }

    async fn online_devices(&self, alias: &str) -> Result<Vec<DeviceInfo>> {
        self.inventory.online_devices().await.map_err(|e| {
            Error::insufficient_resources(alias, format!("device inventory unavailable: {}", e))
        })
    }

    /// Reserve memory for the first hardware configuration that fits.
    ///
    /// The inventory is queried before taking the table lock; the fit check
    /// and the reservation happen under one lock so concurrent allocations
    /// cannot both claim the same headroom.
    pub async fn allocate(&self, definition: &ModelDefinition) -> Result<Lease> {
        let alias = definition.primary_alias();
        let devices = self.online_devices(alias).await?;
        let by_id: HashMap<&str, &DeviceInfo> =
            devices.iter().map(|d| (d.id.as_str(), d)).collect();

        let mut table = lock(&self.table);
        let mut misfits = Vec::new();

        for hw in &definition.hardware {
            match table.misfit(hw, &by_id) {
                None => {
                    let (id, grants) = table.grant(alias, hw);
                    drop(table);

                    info!(
                        alias = %alias,
                        hardware_config = %hw.name,
                        grants = ?grants,
                        "Reserved hardware"
                    );

                    return Ok(Lease {
                        id,
                        alias: alias.to_string(),
                        hardware: hw.clone(),
                        grants,
                        table: Arc::clone(&self.table),
                    });
                }
                Some(reason) => misfits.push(format!("{}: {}", hw.name, reason)),
            }
        }

        Err(Error::insufficient_resources(alias, misfits.join("; ")))
    }

    /// Devices whose memory is the only thing keeping a configuration of
    /// `definition` from fitting
    pub async fn deficit_devices(&self, definition: &ModelDefinition) -> Result<BTreeSet<String>> {
        let devices = self.online_devices(definition.primary_alias()).await?;
        let by_id: HashMap<&str, &DeviceInfo> =
            devices.iter().map(|d| (d.id.as_str(), d)).collect();

        let table = lock(&self.table);
        let mut deficit = BTreeSet::new();

        for hw in &definition.hardware {
            if !hw
                .required_devices
                .iter()
                .all(|id| by_id.contains_key(id.as_str()))
            {
                continue;
            }
            for id in &hw.required_devices {
                if let Some(device) = by_id.get(id.as_str()) {
                    if hw.memory_for(id) > table.effective_free(device) {
                        deficit.insert(id.clone());
                    }
                }
            }
        }

        Ok(deficit)
    }

    /// MB currently reserved on a device
    pub fn reserved_on(&self, device: &str) -> u64 {
        lock(&self.table).reserved_on(device)
    }

    /// Number of outstanding leases
    pub fn lease_count(&self) -> usize {
        lock(&self.table).leases.len()
    }

    /// Devices, reservations and leases
    pub async fn snapshot(&self) -> Result<AllocationSnapshot> {
        let devices = self.inventory.list_devices().await?;
        let table = lock(&self.table);

        let devices = devices
            .into_iter()
            .map(|d| DeviceAllocation {
                reserved_mb: table.reserved_on(&d.id),
                effective_free_mb: table.effective_free(&d),
                id: d.id,
                online: d.online,
                total_memory_mb: d.total_memory_mb,
                reported_free_mb: d.free_memory_mb,
                device_type: d.device_type,
                memory_type: d.memory_type,
                usage_percentage: d.usage_percentage,
                temperature_celsius: d.temperature_celsius,
            })
            .collect();

        let leases = table
            .leases
            .values()
            .map(|r| LeaseSummary {
                alias: r.alias.clone(),
                hardware_config: r.hardware_config.clone(),
                grants_mb: r.grants.clone(),
            })
            .collect();

        Ok(AllocationSnapshot {
            inventory: self.inventory.name().to_string(),
            devices,
            leases,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmhost_adapter_device::MockInventory;
    use llmhost_core::ModelMode;
    use std::path::PathBuf;

    fn hardware(name: &str, memory: &[(&str, u64)]) -> HardwareConfig {
        HardwareConfig {
            name: name.to_string(),
            required_devices: memory.iter().map(|(d, _)| d.to_string()).collect(),
            memory_mb: memory
                .iter()
                .filter(|(_, mb)| *mb > 0)
                .map(|(d, mb)| (d.to_string(), *mb))
                .collect(),
            script: PathBuf::from("true"),
        }
    }

    fn model(alias: &str, hardware: Vec<HardwareConfig>) -> ModelDefinition {
        ModelDefinition {
            aliases: vec![alias.to_string()],
            mode: ModelMode::Chat,
            port: 9001,
            auto_start: false,
            working_dir: None,
            env: Default::default(),
            hardware,
        }
    }

    fn allocator(devices: Vec<DeviceInfo>) -> HardwareAllocator {
        HardwareAllocator::new(Arc::new(MockInventory::new(devices)))
    }

    #[tokio::test]
    async fn test_reserves_first_fitting_config() {
        let allocator = allocator(vec![DeviceInfo::new("rtx 4060", 16000, 16000)]);
        let def = model("qwen-14b", vec![hardware("gpu", &[("rtx 4060", 12000)])]);

        let lease = allocator.allocate(&def).await.unwrap();
        assert_eq!(lease.hardware().name, "gpu");
        assert_eq!(allocator.reserved_on("rtx 4060"), 12000);

        drop(lease);
        assert_eq!(allocator.reserved_on("rtx 4060"), 0);
        assert_eq!(allocator.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_insufficient_memory_fails() {
        let allocator = allocator(vec![DeviceInfo::new("rtx 4060", 16000, 8000)]);
        let def = model("qwen-14b", vec![hardware("gpu", &[("rtx 4060", 12000)])]);

        let err = allocator.allocate(&def).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientResources { ref alias, .. } if alias == "qwen-14b"));
        assert!(err.to_string().contains("12000"));
        assert_eq!(allocator.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_falls_back_to_later_config() {
        let allocator = allocator(vec![
            DeviceInfo::new("gpu0", 8000, 8000),
            DeviceInfo::new("CPU", 64000, 64000),
        ]);
        let def = model(
            "m",
            vec![
                hardware("big-gpu", &[("gpu0", 12000)]),
                hardware("cpu", &[("CPU", 16000)]),
            ],
        );

        let lease = allocator.allocate(&def).await.unwrap();
        assert_eq!(lease.hardware().name, "cpu");
    }

    #[tokio::test]
    async fn test_missing_or_offline_device_does_not_fit() {
        let inventory = MockInventory::new(vec![DeviceInfo::new("gpu0", 8000, 8000)]);
        let allocator = HardwareAllocator::new(Arc::new(inventory.clone()));

        let needs_two = model("m", vec![hardware("pair", &[("gpu0", 0), ("gpu1", 0)])]);
        assert!(allocator.allocate(&needs_two).await.is_err());

        inventory.set_online("gpu0", false).await;
        let needs_one = model("n", vec![hardware("one", &[("gpu0", 0)])]);
        assert!(allocator.allocate(&needs_one).await.is_err());
    }

    #[tokio::test]
    async fn test_reservations_prevent_overcommit() {
        // reported free memory lags behind launches that have not allocated yet
        let allocator = allocator(vec![DeviceInfo::new("gpu0", 16000, 16000)]);
        let a = model("a", vec![hardware("gpu", &[("gpu0", 10000)])]);
        let b = model("b", vec![hardware("gpu", &[("gpu0", 10000)])]);

        let _lease = allocator.allocate(&a).await.unwrap();
        assert!(allocator.allocate(&b).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_allocations_never_exceed_total() {
        let allocator = allocator(vec![DeviceInfo::new("gpu0", 10000, 10000)]);

        let attempts = (0..10).map(|i| {
            let allocator = allocator.clone();
            let def = model(&format!("m{}", i), vec![hardware("gpu", &[("gpu0", 3000)])]);
            tokio::spawn(async move { allocator.allocate(&def).await })
        });

        let leases: Vec<_> = futures::future::join_all(attempts)
            .await
            .into_iter()
            .filter_map(|r| r.unwrap().ok())
            .collect();

        assert_eq!(leases.len(), 3);
        assert_eq!(allocator.reserved_on("gpu0"), 9000);
    }

    #[tokio::test]
    async fn test_deficit_devices_and_snapshot() {
        let allocator = allocator(vec![
            DeviceInfo::new("gpu0", 16000, 16000),
            DeviceInfo::new("gpu1", 16000, 16000),
        ]);
        let holder = model("holder", vec![hardware("gpu", &[("gpu0", 12000)])]);
        let _lease = allocator.allocate(&holder).await.unwrap();

        let wants = model("wants", vec![hardware("gpu", &[("gpu0", 8000), ("gpu1", 1000)])]);
        let deficit = allocator.deficit_devices(&wants).await.unwrap();
        assert_eq!(deficit.into_iter().collect::<Vec<_>>(), vec!["gpu0".to_string()]);

        let snapshot = allocator.snapshot().await.unwrap();
        assert_eq!(snapshot.inventory, "mock");
        let gpu0 = snapshot.devices.iter().find(|d| d.id == "gpu0").unwrap();
        assert_eq!(gpu0.reserved_mb, 12000);
        assert_eq!(gpu0.effective_free_mb, 4000);
        assert_eq!(snapshot.leases.len(), 1);
        assert_eq!(snapshot.leases[0].alias, "holder");
    }

    #[tokio::test]
    async fn test_inventory_failure_reports_insufficient_resources() {
        let inventory = MockInventory::with_defaults();
        inventory.set_failing(true);
        let allocator = HardwareAllocator::new(Arc::new(inventory));
        let def = model("m", vec![hardware("gpu", &[("gpu0", 10)])]);

        assert!(matches!(
            allocator.allocate(&def).await,
            Err(Error::InsufficientResources { .. })
        ));
    }
}
