//! Model supervisor and start coordinator
//!
//! One [`ModelSlot`] per alias holds the lifecycle state, the live instance
//! and the pending launch or stop. Launches and stops run in spawned tasks
//! and are published as shared futures: every caller that arrives while one
//! is in progress attaches to it instead of starting its own, and a caller
//! that goes away (a dropped HTTP request) never aborts the work.
//!
//! Slot locks are only held for bookkeeping, never across an await.

use crate::allocator::{HardwareAllocator, Lease};
use crate::config::SchedulerConfig;
use crate::instance::{ModelInstance, RequestGuard};
use crate::probe::{wait_until_ready, ReadinessProbe};
use crate::process::{shutdown_process, BackendProcess, LaunchSpec, Launcher};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use llmhost_core::{Error, LifecycleState, ModelCatalog, ModelDefinition, ModelMode, Result};
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Attempts to accept a request before giving up on an instance that keeps
/// stopping underneath it
const MAX_ACQUIRE_ATTEMPTS: usize = 3;

/// Outcome of one launch attempt, shared by every caller waiting on it
#[derive(Debug, Clone, thiserror::Error)]
enum StartFailure {
    #[error("{0}")]
    InsufficientResources(String),
    #[error("{0}")]
    StartupFailed(String),
}

impl StartFailure {
    fn from_error(error: Error) -> Self {
        match error {
            Error::InsufficientResources { reason, .. } => Self::InsufficientResources(reason),
            Error::StartupFailed { reason, .. } => Self::StartupFailed(reason),
            other => Self::StartupFailed(other.to_string()),
        }
    }

    fn into_error(self, alias: &str) -> Error {
        match self {
            Self::InsufficientResources(reason) => Error::insufficient_resources(alias, reason),
            Self::StartupFailed(reason) => Error::startup_failed(alias, reason),
        }
    }
}

type StartOutcome = std::result::Result<Arc<ModelInstance>, StartFailure>;
type SharedStart = Shared<BoxFuture<'static, StartOutcome>>;
type SharedStop = Shared<BoxFuture<'static, ()>>;

/// Work in progress on a slot
#[derive(Clone)]
enum Pending {
    Start(SharedStart),
    Stop(SharedStop),
}

impl Pending {
    async fn settled(self) {
        match self {
            Pending::Start(start) => {
                let _ = start.await;
            }
            Pending::Stop(stop) => stop.await,
        }
    }
}

/// A launch that did not reach Running, with whatever it had acquired
struct LaunchFailure {
    failure: StartFailure,
    process: Option<Arc<dyn BackendProcess>>,
    lease: Option<Lease>,
}

impl LaunchFailure {
    fn new(failure: StartFailure) -> Self {
        Self {
            failure,
            process: None,
            lease: None,
        }
    }
}

struct SlotState {
    lifecycle: LifecycleState,
    instance: Option<Arc<ModelInstance>>,
    pending: Option<Pending>,
    launching: Option<Arc<dyn BackendProcess>>,
    last_failure: Option<String>,
}

struct ModelSlot {
    definition: Arc<ModelDefinition>,
    state: Mutex<SlotState>,
}

impl ModelSlot {
    fn new(definition: Arc<ModelDefinition>) -> Self {
        Self {
            definition,
            state: Mutex::new(SlotState {
                lifecycle: LifecycleState::Stopped,
                instance: None,
                pending: None,
                launching: None,
                last_failure: None,
            }),
        }
    }

    fn alias(&self) -> &str {
        self.definition.primary_alias()
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn transition(alias: &str, state: &mut SlotState, next: LifecycleState) {
    if !state.lifecycle.can_transition_to(next) {
        warn!(
            alias = %alias,
            from = %state.lifecycle,
            to = %next,
            "Unexpected lifecycle transition"
        );
    }
    debug!(alias = %alias, from = %state.lifecycle, to = %next, "Lifecycle transition");
    state.lifecycle = next;
}

/// Externally visible view of one model
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub alias: String,
    pub aliases: Vec<String>,
    pub mode: ModelMode,
    pub port: u16,
    pub auto_start: bool,
    pub state: LifecycleState,
    pub hardware_config: Option<String>,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_seconds: Option<u64>,
    pub in_flight: u32,
    pub total_requests: u64,
    pub last_activity: Option<DateTime<Utc>>,
    pub idle_seconds: Option<u64>,
    pub last_failure: Option<String>,
}

#[derive(Debug, Default)]
struct Counters {
    cold_starts: AtomicU64,
    failed_starts: AtomicU64,
    idle_stops: AtomicU64,
    backend_failures: AtomicU64,
    evictions: AtomicU64,
}

/// Supervisor counters and current lifecycle totals
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SupervisorStats {
    pub cold_starts: u64,
    pub failed_starts: u64,
    pub idle_stops: u64,
    pub backend_failures: u64,
    pub evictions: u64,
    pub running: usize,
    pub starting: usize,
}

struct Inner {
    catalog: Arc<ModelCatalog>,
    allocator: HardwareAllocator,
    launcher: Arc<dyn Launcher>,
    probe: Arc<dyn ReadinessProbe>,
    config: SchedulerConfig,
    slots: DashMap<String, Arc<ModelSlot>>,
    cancel: CancellationToken,
    counters: Counters,
}

/// Owns every backend's lifecycle; the only way to start, use or stop one
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        catalog: Arc<ModelCatalog>,
        allocator: HardwareAllocator,
        launcher: Arc<dyn Launcher>,
        probe: Arc<dyn ReadinessProbe>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                catalog,
                allocator,
                launcher,
                probe,
                config,
                slots: DashMap::new(),
                cancel: CancellationToken::new(),
                counters: Counters::default(),
            }),
        }
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.inner.catalog
    }

    pub fn allocator(&self) -> &HardwareAllocator {
        &self.inner.allocator
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Token cancelled when shutdown begins
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    fn slot(&self, definition: &Arc<ModelDefinition>) -> Arc<ModelSlot> {
        let entry = self
            .inner
            .slots
            .entry(definition.primary_alias().to_string())
            .or_insert_with(|| Arc::new(ModelSlot::new(Arc::clone(definition))));
        Arc::clone(entry.value())
    }

    fn slots(&self) -> Vec<Arc<ModelSlot>> {
        self.inner
            .slots
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Return the running instance, launching it first if needed.
    ///
    /// Concurrent callers for a stopped alias share one launch and all see
    /// its outcome.
    pub async fn ensure_running(&self, alias: &str) -> Result<Arc<ModelInstance>> {
        let definition = self.inner.catalog.resolve(alias)?;
        self.ensure_slot_running(&self.slot(&definition)).await
    }

    async fn ensure_slot_running(&self, slot: &Arc<ModelSlot>) -> Result<Arc<ModelInstance>> {
        let alias = slot.alias();
        loop {
            let pending = {
                let mut state = slot.lock();
                match state.lifecycle {
                    LifecycleState::Running => {
                        return state.instance.clone().ok_or_else(|| {
                            Error::internal(format!("'{}' is running without an instance", alias))
                        });
                    }
                    LifecycleState::Stopped => {
                        if self.inner.cancel.is_cancelled() {
                            return Err(Error::startup_failed(alias, "scheduler is shutting down"));
                        }
                        Pending::Start(self.begin_start(slot, &mut state))
                    }
                    LifecycleState::Starting | LifecycleState::Stopping | LifecycleState::Failed => {
                        state.pending.clone().ok_or_else(|| {
                            Error::internal(format!(
                                "'{}' is {} with nothing pending",
                                alias, state.lifecycle
                            ))
                        })?
                    }
                }
            };

            match pending {
                Pending::Start(start) => {
                    return start.await.map_err(|failure| failure.into_error(alias));
                }
                // a start arriving during a stop waits for Stopped, then launches
                Pending::Stop(stop) => stop.await,
            }
        }
    }

    fn begin_start(&self, slot: &Arc<ModelSlot>, state: &mut SlotState) -> SharedStart {
        transition(slot.alias(), state, LifecycleState::Starting);
        state.last_failure = None;

        let supervisor = self.clone();
        let launching = Arc::clone(slot);
        let task = tokio::spawn(async move {
            let launch = AssertUnwindSafe(supervisor.clone().run_launch(Arc::clone(&launching)));
            match launch.catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => Err(supervisor.abandon_launch(&launching, panic_message(&*panic))),
            }
        });
        let start: SharedStart = task
            .map(|joined| {
                joined.unwrap_or_else(|e| {
                    Err(StartFailure::StartupFailed(format!("launch task failed: {}", e)))
                })
            })
            .boxed()
            .shared();

        state.pending = Some(Pending::Start(start.clone()));
        start
    }

    async fn run_launch(self, slot: Arc<ModelSlot>) -> StartOutcome {
        let alias = slot.alias().to_string();
        let started = Instant::now();

        match self.launch_instance(&slot).await {
            Ok(instance) => {
                {
                    let mut state = slot.lock();
                    transition(&alias, &mut state, LifecycleState::Running);
                    state.instance = Some(Arc::clone(&instance));
                    state.launching = None;
                    state.pending = None;
                }
                self.inner.counters.cold_starts.fetch_add(1, Ordering::Relaxed);

                info!(
                    alias = %alias,
                    port = instance.port(),
                    pid = ?instance.process().pid(),
                    hardware_config = %instance.hardware().name,
                    elapsed = ?started.elapsed(),
                    "Model is running"
                );
                Ok(instance)
            }
            Err(LaunchFailure {
                failure,
                process,
                lease,
            }) => {
                warn!(alias = %alias, "Start failed: {}", failure);
                {
                    let mut state = slot.lock();
                    transition(&alias, &mut state, LifecycleState::Failed);
                }

                if let Some(process) = process {
                    let exit = shutdown_process(process.as_ref(), self.inner.config.stop_grace).await;
                    debug!(alias = %alias, "Failed backend ended with {}", exit);
                }
                drop(lease);

                {
                    let mut state = slot.lock();
                    transition(&alias, &mut state, LifecycleState::Stopped);
                    state.instance = None;
                    state.launching = None;
                    state.pending = None;
                    state.last_failure = Some(failure.to_string());
                }
                self.inner
                    .counters
                    .failed_starts
                    .fetch_add(1, Ordering::Relaxed);

                Err(failure)
            }
        }
    }

    /// Reset a slot whose launch task panicked so later starts can run
    fn abandon_launch(&self, slot: &ModelSlot, reason: String) -> StartFailure {
        let alias = slot.alias();
        error!(alias = %alias, "Launch task panicked: {}", reason);
        let failure = StartFailure::StartupFailed(format!("launch task panicked: {}", reason));

        let process = {
            let mut state = slot.lock();
            transition(alias, &mut state, LifecycleState::Failed);
            transition(alias, &mut state, LifecycleState::Stopped);
            state.instance = None;
            state.pending = None;
            state.last_failure = Some(failure.to_string());
            state.launching.take()
        };
        if let Some(process) = process {
            warn!(alias = %alias, pid = ?process.pid(), "Killing orphaned backend");
            process.kill();
        }
        self.inner
            .counters
            .failed_starts
            .fetch_add(1, Ordering::Relaxed);

        failure
    }

    async fn launch_instance(
        &self,
        slot: &Arc<ModelSlot>,
    ) -> std::result::Result<Arc<ModelInstance>, LaunchFailure> {
        let definition = &slot.definition;
        let alias = definition.primary_alias();
        let config = &self.inner.config;

        let lease = self
            .allocate(definition)
            .await
            .map_err(|e| LaunchFailure::new(StartFailure::from_error(e)))?;

        let spec = LaunchSpec::new(definition, lease.hardware());
        let process = match self.inner.launcher.launch(&spec).await {
            Ok(process) => process,
            Err(e) => {
                return Err(LaunchFailure {
                    failure: StartFailure::from_error(e),
                    process: None,
                    lease: Some(lease),
                })
            }
        };
        slot.lock().launching = Some(Arc::clone(&process));

        let ready = wait_until_ready(
            alias,
            definition.port,
            process.as_ref(),
            self.inner.probe.as_ref(),
            &config.probe,
            config.startup_timeout,
            &self.inner.cancel,
        )
        .await;

        if let Err(e) = ready {
            return Err(LaunchFailure {
                failure: StartFailure::from_error(e),
                process: Some(process),
                lease: Some(lease),
            });
        }

        Ok(Arc::new(ModelInstance::new(
            Arc::clone(definition),
            lease,
            process,
            config.idle.half_life(),
        )))
    }

    async fn allocate(&self, definition: &ModelDefinition) -> Result<Lease> {
        match self.inner.allocator.allocate(definition).await {
            Err(e @ Error::InsufficientResources { .. })
                if self.inner.config.evict_idle_for_resources =>
            {
                if self.evict_for(definition).await {
                    self.inner.allocator.allocate(definition).await
                } else {
                    Err(e)
                }
            }
            other => other,
        }
    }

    /// Stop the least recently active idle model holding memory on a device
    /// `definition` is short of
    async fn evict_for(&self, definition: &ModelDefinition) -> bool {
        let deficit = match self.inner.allocator.deficit_devices(definition).await {
            Ok(deficit) if !deficit.is_empty() => deficit,
            _ => return false,
        };

        let mut victim: Option<(Instant, Arc<ModelSlot>)> = None;
        for slot in self.slots() {
            if slot.alias() == definition.primary_alias() {
                continue;
            }
            let last_activity = {
                let state = slot.lock();
                match &state.instance {
                    Some(instance)
                        if state.lifecycle == LifecycleState::Running
                            && instance.in_flight() == 0
                            && instance.holds_memory_on(&deficit) =>
                    {
                        instance.last_activity()
                    }
                    _ => continue,
                }
            };
            if victim.as_ref().map_or(true, |(oldest, _)| last_activity < *oldest) {
                victim = Some((last_activity, slot));
            }
        }

        let Some((_, slot)) = victim else {
            return false;
        };

        let stop = {
            let mut state = slot.lock();
            let idle = state.lifecycle == LifecycleState::Running
                && state.instance.as_ref().map_or(false, |i| i.in_flight() == 0);
            if idle {
                self.begin_stop(&slot, &mut state, LifecycleState::Stopping)
            } else {
                None
            }
        };

        match stop {
            Some(stop) => {
                info!(
                    alias = %slot.alias(),
                    requested_by = %definition.primary_alias(),
                    "Evicting idle model to free hardware"
                );
                stop.await;
                self.inner.counters.evictions.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Ensure the alias is running and count a request against it.
    ///
    /// The request is accepted under the slot lock, so the reaper either
    /// sees it in flight or has already begun stopping the instance, in
    /// which case the next attempt waits for the stop and relaunches.
    pub async fn acquire(&self, alias: &str) -> Result<RequestGuard> {
        let definition = self.inner.catalog.resolve(alias)?;
        let slot = self.slot(&definition);

        for attempt in 1..=MAX_ACQUIRE_ATTEMPTS {
            let instance = self.ensure_slot_running(&slot).await?;
            {
                let state = slot.lock();
                let current = state
                    .instance
                    .as_ref()
                    .filter(|_| state.lifecycle == LifecycleState::Running)
                    .map_or(false, |i| i.id() == instance.id());
                if current {
                    return Ok(instance.begin_request());
                }
            }
            debug!(alias = %slot.alias(), attempt, "Instance stopped before the request was accepted");
        }

        Err(Error::backend_unavailable(
            slot.alias(),
            "instance kept stopping before the request could be accepted",
        ))
    }

    /// Stop the alias; a no-op when already stopped, waits out a pending
    /// start first
    pub async fn stop(&self, alias: &str) -> Result<()> {
        let definition = self.inner.catalog.resolve(alias)?;
        self.stop_slot(&self.slot(&definition)).await
    }

    async fn stop_slot(&self, slot: &Arc<ModelSlot>) -> Result<()> {
        loop {
            let pending = {
                let mut state = slot.lock();
                match state.lifecycle {
                    LifecycleState::Stopped => return Ok(()),
                    LifecycleState::Running => {
                        info!(alias = %slot.alias(), "Stopping model");
                        self.begin_stop(slot, &mut state, LifecycleState::Stopping)
                            .map(Pending::Stop)
                    }
                    _ => state.pending.clone(),
                }
            };

            match pending {
                Some(pending) => pending.settled().await,
                None => {
                    return Err(Error::internal(format!(
                        "'{}' has no work pending to wait for",
                        slot.alias()
                    )))
                }
            }
        }
    }

    /// Move a Running slot to `next` (Stopping or Failed) and tear the
    /// instance down in the background
    fn begin_stop(
        &self,
        slot: &Arc<ModelSlot>,
        state: &mut SlotState,
        next: LifecycleState,
    ) -> Option<SharedStop> {
        let instance = state.instance.clone()?;
        transition(slot.alias(), state, next);

        let alias = slot.alias().to_string();
        let task = tokio::spawn(self.clone().teardown(Arc::clone(slot), instance));
        let stop: SharedStop = task
            .map(move |joined| {
                if let Err(e) = joined {
                    error!(alias = %alias, "Stop task failed: {}", e);
                }
            })
            .boxed()
            .shared();

        state.pending = Some(Pending::Stop(stop.clone()));
        Some(stop)
    }

    async fn teardown(self, slot: Arc<ModelSlot>, instance: Arc<ModelInstance>) {
        let exit = shutdown_process(instance.process().as_ref(), self.inner.config.stop_grace).await;
        instance.release_lease();

        {
            let mut state = slot.lock();
            transition(slot.alias(), &mut state, LifecycleState::Stopped);
            state.instance = None;
            state.pending = None;
        }

        info!(
            alias = %slot.alias(),
            uptime = ?instance.uptime(),
            "Model stopped ({})",
            exit
        );
    }

    /// Stop every model that is not stopped; returns their aliases
    pub async fn stop_all(&self) -> Vec<String> {
        let active: Vec<Arc<ModelSlot>> = self
            .slots()
            .into_iter()
            .filter(|slot| slot.lock().lifecycle != LifecycleState::Stopped)
            .collect();

        let results = join_all(active.iter().map(|slot| self.stop_slot(slot))).await;
        for (slot, result) in active.iter().zip(results) {
            if let Err(e) = result {
                error!(alias = %slot.alias(), "Failed to stop model: {}", e);
            }
        }

        active.iter().map(|slot| slot.alias().to_string()).collect()
    }

    /// Begin stopping every running model the idle policy marks as expired.
    ///
    /// Returns the number of stops begun; teardown runs in the background.
    pub fn reap_idle(&self) -> usize {
        let policy = &self.inner.config.idle;
        if !policy.is_enabled() {
            return 0;
        }

        let now = Instant::now();
        let mut stopped = 0;

        for slot in self.slots() {
            let mut state = slot.lock();
            if state.lifecycle != LifecycleState::Running {
                continue;
            }
            let Some(instance) = state.instance.clone() else {
                continue;
            };

            let decision = instance.idle_decision(policy, now);
            if !decision.should_stop() {
                debug!(alias = %slot.alias(), ?decision, "Keeping model");
                continue;
            }

            info!(alias = %slot.alias(), ?decision, "Stopping idle model");
            if self
                .begin_stop(&slot, &mut state, LifecycleState::Stopping)
                .is_some()
            {
                stopped += 1;
            }
        }

        self.inner
            .counters
            .idle_stops
            .fetch_add(stopped as u64, Ordering::Relaxed);
        stopped
    }

    /// Tear down running models whose process has exited on its own
    pub fn reap_exited(&self) -> usize {
        let mut reaped = 0;

        for slot in self.slots() {
            let mut state = slot.lock();
            if state.lifecycle != LifecycleState::Running {
                continue;
            }
            let Some(exit) = state
                .instance
                .as_ref()
                .and_then(|instance| instance.process().try_exit())
            else {
                continue;
            };

            warn!(alias = %slot.alias(), "Backend exited unexpectedly with {}", exit);
            state.last_failure = Some(format!("backend exited unexpectedly with {}", exit));
            if self
                .begin_stop(&slot, &mut state, LifecycleState::Failed)
                .is_some()
            {
                reaped += 1;
            }
        }

        self.inner
            .counters
            .backend_failures
            .fetch_add(reaped as u64, Ordering::Relaxed);
        reaped
    }

    /// A forward to `instance_id` could not reach its backend: fail the
    /// instance and tear it down.
    ///
    /// Returns false when the instance is no longer the running one.
    pub fn report_backend_failure(&self, alias: &str, instance_id: Uuid, reason: &str) -> bool {
        let Ok(definition) = self.inner.catalog.resolve(alias) else {
            return false;
        };
        let slot = self.slot(&definition);
        let mut state = slot.lock();

        let current = state.lifecycle == LifecycleState::Running
            && state
                .instance
                .as_ref()
                .map_or(false, |i| i.id() == instance_id);
        if !current {
            return false;
        }

        warn!(alias = %slot.alias(), "Backend unavailable, tearing down: {}", reason);
        state.last_failure = Some(format!("backend unavailable: {}", reason));
        self.inner
            .counters
            .backend_failures
            .fetch_add(1, Ordering::Relaxed);
        self.begin_stop(&slot, &mut state, LifecycleState::Failed)
            .is_some()
    }

    /// Launch every `auto_start` model in the background
    pub fn start_auto_models(&self) -> usize {
        let mut started = 0;
        for definition in self.inner.catalog.iter().filter(|d| d.auto_start) {
            let supervisor = self.clone();
            let slot = self.slot(definition);
            tokio::spawn(async move {
                match supervisor.ensure_slot_running(&slot).await {
                    Ok(_) => info!(alias = %slot.alias(), "Auto-started model"),
                    Err(e) => error!(alias = %slot.alias(), "Auto-start failed: {}", e),
                }
            });
            started += 1;
        }
        started
    }

    pub fn state(&self, alias: &str) -> Result<LifecycleState> {
        let definition = self.inner.catalog.resolve(alias)?;
        Ok(self.slot(&definition).lock().lifecycle)
    }

    pub fn info(&self, alias: &str) -> Result<ModelInfo> {
        let definition = self.inner.catalog.resolve(alias)?;
        Ok(describe(&self.slot(&definition)))
    }

    /// Every model in catalog order
    pub fn list(&self) -> Vec<ModelInfo> {
        self.inner
            .catalog
            .iter()
            .map(|definition| describe(&self.slot(definition)))
            .collect()
    }

    pub fn stats(&self) -> SupervisorStats {
        let counters = &self.inner.counters;
        let mut stats = SupervisorStats {
            cold_starts: counters.cold_starts.load(Ordering::Relaxed),
            failed_starts: counters.failed_starts.load(Ordering::Relaxed),
            idle_stops: counters.idle_stops.load(Ordering::Relaxed),
            backend_failures: counters.backend_failures.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            ..Default::default()
        };
        for slot in self.slots() {
            match slot.lock().lifecycle {
                LifecycleState::Running => stats.running += 1,
                LifecycleState::Starting => stats.starting += 1,
                _ => {}
            }
        }
        stats
    }

    /// Cancel pending probes and stop everything, killing whatever is left
    /// when `shutdown_timeout` runs out
    pub async fn shutdown(&self) {
        self.shutdown_until(Instant::now() + self.inner.config.shutdown_timeout)
            .await
    }

    /// Like [`Supervisor::shutdown`], bounded by an absolute deadline shared
    /// with other shutdown work
    pub async fn shutdown_until(&self, deadline: Instant) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        info!(remaining = ?remaining, "Stopping all models");
        self.inner.cancel.cancel();

        match tokio::time::timeout_at(deadline, self.stop_all()).await {
            Ok(stopped) => info!(count = stopped.len(), "All models stopped"),
            Err(_) => {
                warn!("Models did not stop before the shutdown deadline, killing");
                self.kill_all();
            }
        }
    }

    fn kill_all(&self) {
        for slot in self.slots() {
            let state = slot.lock();
            if let Some(instance) = &state.instance {
                warn!(alias = %slot.alias(), pid = ?instance.process().pid(), "Killing backend");
                instance.process().kill();
                instance.release_lease();
            }
            if let Some(process) = &state.launching {
                warn!(alias = %slot.alias(), pid = ?process.pid(), "Killing starting backend");
                process.kill();
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn describe(slot: &ModelSlot) -> ModelInfo {
    let definition = &slot.definition;
    let state = slot.lock();

    let mut info = ModelInfo {
        alias: definition.primary_alias().to_string(),
        aliases: definition.aliases.clone(),
        mode: definition.mode,
        port: definition.port,
        auto_start: definition.auto_start,
        state: state.lifecycle,
        hardware_config: None,
        pid: state.launching.as_ref().and_then(|p| p.pid()),
        started_at: None,
        uptime_seconds: None,
        in_flight: 0,
        total_requests: 0,
        last_activity: None,
        idle_seconds: None,
        last_failure: state.last_failure.clone(),
    };

    if let Some(instance) = &state.instance {
        info.hardware_config = Some(instance.hardware().name.clone());
        info.pid = instance.process().pid();
        info.started_at = Some(instance.started_at());
        info.uptime_seconds = Some(instance.uptime().as_secs());
        info.in_flight = instance.in_flight();
        info.total_requests = instance.total_requests();
        info.last_activity = Some(instance.last_activity_at());
        info.idle_seconds = Some(instance.last_activity().elapsed().as_secs());
    }

    info
}
