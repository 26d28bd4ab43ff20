//! Scheduler configuration
//!
//! Runtime form of the `scheduler` settings section, with durations instead
//! of raw second and millisecond counts.

use crate::idle::IdlePolicy;
use llmhost_core::{ProbeSettings, SchedulerSettings};
use std::time::Duration;

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Period of the idle reaper and exit watcher
    pub reaper_interval: Duration,

    /// Bound on launch plus readiness
    pub startup_timeout: Duration,

    /// Time between SIGTERM and SIGKILL
    pub stop_grace: Duration,

    /// Bound on stopping everything at daemon exit
    pub shutdown_timeout: Duration,

    /// Readiness probe configuration
    pub probe: ProbeConfig,

    /// Idle reaping policy
    pub idle: IdlePolicy,

    /// Stop idle models to make room for a start that does not fit
    pub evict_idle_for_resources: bool,
}

/// Readiness probe configuration
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// HTTP path polled on the backend
    pub path: String,

    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,

    /// Bound on a single probe request
    pub request_timeout: Duration,
}

impl ProbeConfig {
    /// Backoff before the given attempt (1-based), doubling up to the cap
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl From<&ProbeSettings> for ProbeConfig {
    fn from(settings: &ProbeSettings) -> Self {
        Self {
            path: settings.path.clone(),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            max_attempts: settings.max_attempts,
            request_timeout: Duration::from_millis(settings.request_timeout_ms),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self::from(&ProbeSettings::default())
    }
}

impl From<&SchedulerSettings> for SchedulerConfig {
    fn from(settings: &SchedulerSettings) -> Self {
        Self {
            reaper_interval: Duration::from_secs(settings.reaper_interval_seconds),
            startup_timeout: Duration::from_secs(settings.startup_timeout_seconds),
            stop_grace: Duration::from_secs(settings.stop_grace_seconds),
            shutdown_timeout: Duration::from_secs(settings.shutdown_timeout_seconds),
            probe: ProbeConfig::from(&settings.probe),
            idle: IdlePolicy::from_settings(settings.alive_time_minutes, &settings.idle),
            evict_idle_for_resources: settings.evict_idle_for_resources,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&SchedulerSettings::default())
    }
}

impl SchedulerConfig {
    /// Builder pattern for tests and embedding
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    pub fn with_idle_policy(mut self, idle: IdlePolicy) -> Self {
        self.idle = idle;
        self
    }

    pub fn with_probe(mut self, probe: ProbeConfig) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_eviction(mut self, enabled: bool) -> Self {
        self.evict_idle_for_resources = enabled;
        self
    }
}
