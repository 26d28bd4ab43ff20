//! Live model instances and request accounting

use crate::allocator::Lease;
use crate::idle::{ActivityState, IdleDecision, IdlePolicy};
use crate::process::BackendProcess;
use chrono::{DateTime, Utc};
use llmhost_core::{HardwareConfig, ModelDefinition};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// A launched backend together with its reservation and request activity
#[derive(Debug)]
pub struct ModelInstance {
    id: Uuid,
    definition: Arc<ModelDefinition>,
    hardware: HardwareConfig,
    grants: BTreeMap<String, u64>,
    lease: Mutex<Option<Lease>>,
    process: Arc<dyn BackendProcess>,
    started_at: DateTime<Utc>,
    started: Instant,
    half_life: Duration,
    activity: Mutex<ActivityState>,
}

impl ModelInstance {
    pub fn new(
        definition: Arc<ModelDefinition>,
        lease: Lease,
        process: Arc<dyn BackendProcess>,
        half_life: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            hardware: lease.hardware().clone(),
            grants: lease.grants().clone(),
            lease: Mutex::new(Some(lease)),
            definition,
            process,
            started_at: Utc::now(),
            started: now,
            half_life,
            activity: Mutex::new(ActivityState::new(now)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn alias(&self) -> &str {
        self.definition.primary_alias()
    }

    pub fn definition(&self) -> &Arc<ModelDefinition> {
        &self.definition
    }

    pub fn port(&self) -> u16 {
        self.definition.port
    }

    pub fn hardware(&self) -> &HardwareConfig {
        &self.hardware
    }

    /// MB reserved per device while the lease is held
    pub fn grants(&self) -> &BTreeMap<String, u64> {
        &self.grants
    }

    /// Whether the instance reserves memory on any of `devices`
    pub fn holds_memory_on(&self, devices: &BTreeSet<String>) -> bool {
        self.grants
            .iter()
            .any(|(device, mb)| *mb > 0 && devices.contains(device))
    }

    pub fn process(&self) -> &Arc<dyn BackendProcess> {
        &self.process
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    fn activity(&self) -> MutexGuard<'_, ActivityState> {
        self.activity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count a request as accepted.
    ///
    /// Stamping activity and raising the in-flight count happen under one
    /// lock, so the reaper never sees an accepted request as idle time.
    pub fn begin_request(self: &Arc<Self>) -> RequestGuard {
        self.activity().accept(Instant::now(), self.half_life);
        RequestGuard {
            instance: Arc::clone(self),
        }
    }

    pub fn in_flight(&self) -> u32 {
        self.activity().in_flight
    }

    pub fn total_requests(&self) -> u64 {
        self.activity().total_requests
    }

    pub fn last_activity(&self) -> Instant {
        self.activity().last_activity
    }

    /// Wall clock time of the last accepted or completed request
    pub fn last_activity_at(&self) -> DateTime<Utc> {
        let idle = self.last_activity().elapsed();
        Utc::now() - chrono::Duration::from_std(idle).unwrap_or_else(|_| chrono::Duration::zero())
    }

    pub fn idle_decision(&self, policy: &IdlePolicy, now: Instant) -> IdleDecision {
        policy.evaluate(&self.activity(), now)
    }

    /// Give the hardware reservation back; later calls do nothing
    pub fn release_lease(&self) {
        let lease = self
            .lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(lease);
    }

    pub fn holds_lease(&self) -> bool {
        self.lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// In-flight marker for one forwarded request; dropping it completes the
/// request
#[derive(Debug)]
pub struct RequestGuard {
    instance: Arc<ModelInstance>,
}

impl RequestGuard {
    pub fn instance(&self) -> &Arc<ModelInstance> {
        &self.instance
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.instance.activity().complete(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::HardwareAllocator;
    use crate::mock::MockProcess;
    use llmhost_adapter_device::MockInventory;
    use llmhost_core::{DeviceInfo, ModelMode};
    use std::path::PathBuf;

    async fn instance() -> (Arc<ModelInstance>, HardwareAllocator) {
        let allocator = HardwareAllocator::new(Arc::new(MockInventory::new(vec![
            DeviceInfo::new("gpu0", 16000, 16000),
        ])));
        let definition = Arc::new(ModelDefinition {
            aliases: vec!["m".to_string()],
            mode: ModelMode::Chat,
            port: 9001,
            auto_start: false,
            working_dir: None,
            env: Default::default(),
            hardware: vec![HardwareConfig {
                name: "gpu".to_string(),
                required_devices: ["gpu0".to_string()].into(),
                memory_mb: [("gpu0".to_string(), 4000)].into(),
                script: PathBuf::from("true"),
            }],
        });
        let lease = allocator.allocate(&definition).await.unwrap();
        let instance = ModelInstance::new(
            definition,
            lease,
            MockProcess::new(42),
            Duration::from_secs(300),
        );
        (Arc::new(instance), allocator)
    }

    #[tokio::test]
    async fn test_request_guard_tracks_in_flight() {
        let (instance, _allocator) = instance().await;

        let first = instance.begin_request();
        let second = instance.begin_request();
        assert_eq!(instance.in_flight(), 2);

        drop(first);
        assert_eq!(instance.in_flight(), 1);
        drop(second);
        assert_eq!(instance.in_flight(), 0);
        assert_eq!(instance.total_requests(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acceptance_stamps_activity() {
        let (instance, _allocator) = instance().await;
        let before = instance.last_activity();

        tokio::time::advance(Duration::from_secs(10)).await;
        let guard = instance.begin_request();
        assert!(instance.last_activity() >= before + Duration::from_secs(10));

        // a long request is never idle, however old the stamp gets
        tokio::time::advance(Duration::from_secs(7200)).await;
        let policy = IdlePolicy::new(
            Some(Duration::from_secs(60)),
            Duration::from_secs(300),
            0.05,
            0.5,
        );
        assert!(!instance.idle_decision(&policy, Instant::now()).should_stop());

        drop(guard);
        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(instance.idle_decision(&policy, Instant::now()).should_stop());
    }

    #[tokio::test]
    async fn test_release_lease_is_idempotent() {
        let (instance, allocator) = instance().await;
        assert_eq!(allocator.reserved_on("gpu0"), 4000);

        instance.release_lease();
        instance.release_lease();
        assert!(!instance.holds_lease());
        assert_eq!(allocator.reserved_on("gpu0"), 0);
    }
}
