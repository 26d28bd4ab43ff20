//! Mock launcher, process and probe for testing

use crate::probe::ReadinessProbe;
use crate::process::{BackendProcess, ExitInfo, LaunchSpec, Launcher};
use async_trait::async_trait;
use llmhost_core::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Process that only exists in memory
#[derive(Debug)]
pub struct MockProcess {
    pid: u32,
    exit: watch::Sender<Option<ExitInfo>>,
    ignore_terminate: AtomicBool,
    terminate_calls: AtomicUsize,
    kill_calls: AtomicUsize,
}

impl MockProcess {
    pub fn new(pid: u32) -> Arc<Self> {
        let (exit, _) = watch::channel(None);
        Arc::new(Self {
            pid,
            exit,
            ignore_terminate: AtomicBool::new(false),
            terminate_calls: AtomicUsize::new(0),
            kill_calls: AtomicUsize::new(0),
        })
    }

    /// Simulate the process ending on its own
    pub fn exit_with(&self, code: Option<i32>, signal: Option<i32>) {
        self.exit.send_if_modified(|exit| {
            if exit.is_none() {
                *exit = Some(ExitInfo { code, signal });
                true
            } else {
                false
            }
        });
    }

    /// Make SIGTERM a no-op so stops escalate to SIGKILL
    pub fn ignore_terminate(&self, ignore: bool) {
        self.ignore_terminate.store(ignore, Ordering::SeqCst);
    }

    pub fn terminate_calls(&self) -> usize {
        self.terminate_calls.load(Ordering::SeqCst)
    }

    pub fn kill_calls(&self) -> usize {
        self.kill_calls.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }
}

#[async_trait]
impl BackendProcess for MockProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn try_exit(&self) -> Option<ExitInfo> {
        self.exit.borrow().clone()
    }

    fn terminate(&self) {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        if !self.ignore_terminate.load(Ordering::SeqCst) {
            self.exit_with(None, Some(15));
        }
    }

    fn kill(&self) {
        self.kill_calls.fetch_add(1, Ordering::SeqCst);
        self.exit_with(None, Some(9));
    }

    async fn wait(&self) -> ExitInfo {
        let mut exit = self.exit.subscribe();
        let result = exit.wait_for(Option::is_some).await;
        match result {
            Ok(value) => value.clone().unwrap_or_else(ExitInfo::unknown),
            Err(_) => ExitInfo::unknown(),
        }
    }
}

/// Launcher that records launches and hands out [`MockProcess`]es
#[derive(Debug, Default)]
pub struct MockLauncher {
    launches: AtomicUsize,
    delay: Mutex<Duration>,
    fail: AtomicBool,
    exit_code_after_launch: Mutex<Option<i32>>,
    processes: Mutex<Vec<(String, Arc<MockProcess>)>>,
}

impl MockLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Time each launch takes before returning
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Make the script itself fail to run
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Launched processes end immediately with this code
    pub fn set_exit_after_launch(&self, code: Option<i32>) {
        *self
            .exit_code_after_launch
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = code;
    }

    /// Number of launch attempts so far
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Launches for one alias
    pub fn launches_of(&self, alias: &str) -> usize {
        self.processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(a, _)| a == alias)
            .count()
    }

    /// Most recent process launched for an alias
    pub fn last_process(&self, alias: &str) -> Option<Arc<MockProcess>> {
        self.processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|(a, _)| a == alias)
            .map(|(_, p)| Arc::clone(p))
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn BackendProcess>> {
        let n = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(alias = %spec.alias, launch = n, "Mock launch");

        let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::startup_failed(&spec.alias, "mock launch failure"));
        }

        let process = MockProcess::new(10_000 + n as u32);
        let exit_code = *self
            .exit_code_after_launch
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(code) = exit_code {
            process.exit_with(Some(code), None);
        }

        self.processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((spec.alias.clone(), Arc::clone(&process)));

        Ok(process)
    }
}

/// Probe with scripted answers
#[derive(Debug)]
pub struct MockProbe {
    ready_after: Option<u32>,
    forced_ready: AtomicBool,
    checks: AtomicU32,
}

impl MockProbe {
    /// Ready on the first check
    pub fn ready() -> Self {
        Self::ready_after(1)
    }

    /// Ready from the `n`-th check on
    pub fn ready_after(n: u32) -> Self {
        Self {
            ready_after: Some(n),
            forced_ready: AtomicBool::new(false),
            checks: AtomicU32::new(0),
        }
    }

    pub fn never_ready() -> Self {
        Self {
            ready_after: None,
            forced_ready: AtomicBool::new(false),
            checks: AtomicU32::new(0),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.forced_ready.store(ready, Ordering::SeqCst);
    }

    pub fn checks(&self) -> u32 {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReadinessProbe for MockProbe {
    async fn check(&self, port: u16) -> std::result::Result<(), String> {
        let n = self.checks.fetch_add(1, Ordering::SeqCst) + 1;
        let ready = self.forced_ready.load(Ordering::SeqCst)
            || self.ready_after.map_or(false, |after| n >= after);
        if ready {
            Ok(())
        } else {
            Err(format!("connection refused on port {}", port))
        }
    }
}
