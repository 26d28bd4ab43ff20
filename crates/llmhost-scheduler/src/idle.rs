//! Usage-weighted idle policy
//!
//! Every accepted request adds 1 to a weight that halves every
//! `half_life`. Once a model has been idle for `alive_time`, the remaining
//! weight extends the threshold by up to `max_extension_ratio`, so a model
//! that was busy until recently is not stopped the moment it crosses the
//! base threshold and then restarted by the next burst.

use llmhost_core::IdleSettings;
use std::time::Duration;
use tokio::time::Instant;

/// Per-instance request activity, updated at acceptance and completion
#[derive(Debug, Clone)]
pub struct ActivityState {
    pub last_activity: Instant,
    pub in_flight: u32,
    pub weight: f64,
    pub weight_stamp: Instant,
    pub total_requests: u64,
}

impl ActivityState {
    pub fn new(now: Instant) -> Self {
        Self {
            last_activity: now,
            in_flight: 0,
            weight: 0.0,
            weight_stamp: now,
            total_requests: 0,
        }
    }

    /// Stamp a newly accepted request
    pub fn accept(&mut self, now: Instant, half_life: Duration) {
        let elapsed = now.saturating_duration_since(self.weight_stamp);
        self.weight = decay(self.weight, elapsed, half_life) + 1.0;
        self.weight_stamp = now;
        self.last_activity = self.last_activity.max(now);
        self.in_flight += 1;
        self.total_requests += 1;
    }

    /// Stamp a finished (or abandoned) request
    pub fn complete(&mut self, now: Instant) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.last_activity = self.last_activity.max(now);
    }
}

/// Result of evaluating an instance against the policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IdleDecision {
    /// Reaping is turned off
    Disabled,
    /// Requests are in flight
    Busy { in_flight: u32 },
    /// Not idle long enough yet
    Keep { idle: Duration, required: Duration },
    /// Idle past the weighted threshold
    Expired { idle: Duration, required: Duration },
}

impl IdleDecision {
    pub fn should_stop(&self) -> bool {
        matches!(self, IdleDecision::Expired { .. })
    }
}

/// Idle reaping policy
#[derive(Debug, Clone, PartialEq)]
pub struct IdlePolicy {
    alive_time: Option<Duration>,
    half_life: Duration,
    weight_factor: f64,
    max_extension_ratio: f64,
}

impl IdlePolicy {
    pub fn new(
        alive_time: Option<Duration>,
        half_life: Duration,
        weight_factor: f64,
        max_extension_ratio: f64,
    ) -> Self {
        Self {
            alive_time: alive_time.filter(|d| !d.is_zero()),
            half_life,
            weight_factor,
            max_extension_ratio,
        }
    }

    pub fn from_settings(alive_time_minutes: u64, settings: &IdleSettings) -> Self {
        Self::new(
            Some(Duration::from_secs(alive_time_minutes * 60)),
            Duration::from_secs(settings.decay_half_life_seconds),
            settings.weight_factor,
            settings.max_extension_ratio,
        )
    }

    /// Policy that never stops anything
    pub fn disabled() -> Self {
        Self::new(None, Duration::from_secs(300), 0.0, 0.0)
    }

    pub fn is_enabled(&self) -> bool {
        self.alive_time.is_some()
    }

    pub fn alive_time(&self) -> Option<Duration> {
        self.alive_time
    }

    pub fn half_life(&self) -> Duration {
        self.half_life
    }

    /// Idle time required before stopping, given the weight still left
    pub fn required_idle(&self, remaining_weight: f64) -> Option<Duration> {
        let alive_time = self.alive_time?;
        let extension = (self.weight_factor * remaining_weight).min(self.max_extension_ratio);
        Some(alive_time.mul_f64(1.0 + extension.max(0.0)))
    }

    pub fn evaluate(&self, activity: &ActivityState, now: Instant) -> IdleDecision {
        let Some(alive_time) = self.alive_time else {
            return IdleDecision::Disabled;
        };

        if activity.in_flight > 0 {
            return IdleDecision::Busy {
                in_flight: activity.in_flight,
            };
        }

        let idle = now.saturating_duration_since(activity.last_activity);
        if idle < alive_time {
            return IdleDecision::Keep {
                idle,
                required: alive_time,
            };
        }

        let remaining = decay(
            activity.weight,
            now.saturating_duration_since(activity.weight_stamp),
            self.half_life,
        );
        let required = self.required_idle(remaining).unwrap_or(alive_time);

        if idle >= required {
            IdleDecision::Expired { idle, required }
        } else {
            IdleDecision::Keep { idle, required }
        }
    }
}

fn decay(weight: f64, elapsed: Duration, half_life: Duration) -> f64 {
    if half_life.is_zero() {
        return 0.0;
    }
    weight * 0.5f64.powf(elapsed.as_secs_f64() / half_life.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    fn policy() -> IdlePolicy {
        IdlePolicy::new(Some(30 * MINUTE), Duration::from_secs(300), 0.05, 0.5)
    }

    #[test]
    fn test_in_flight_always_vetoes() {
        let start = Instant::now();
        let mut activity = ActivityState::new(start);
        activity.accept(start, Duration::from_secs(300));

        let decision = policy().evaluate(&activity, start + 1000 * MINUTE);
        assert_eq!(decision, IdleDecision::Busy { in_flight: 1 });
        assert!(!decision.should_stop());
    }

    #[test]
    fn test_quiet_model_stops_after_alive_time() {
        let start = Instant::now();
        let activity = ActivityState::new(start);

        assert!(!policy().evaluate(&activity, start + 29 * MINUTE).should_stop());
        assert!(policy().evaluate(&activity, start + 31 * MINUTE).should_stop());
    }

    #[test]
    fn test_recent_heavy_use_extends_threshold() {
        let start = Instant::now();
        let half_life = Duration::from_secs(300);
        let mut activity = ActivityState::new(start);

        // 100 requests per second for the 200 seconds before going quiet
        let burst_start = start + 29 * MINUTE - Duration::from_secs(200);
        for i in 0..20_000u64 {
            let at = burst_start + Duration::from_millis(10 * i);
            activity.accept(at, half_life);
            activity.complete(at);
        }
        let burst_end = activity.last_activity;

        let policy = policy();
        let decision = policy.evaluate(&activity, burst_end + 31 * MINUTE);
        match decision {
            IdleDecision::Keep { required, .. } => assert!(required > 30 * MINUTE),
            other => panic!("expected the threshold to be extended, got {:?}", other),
        }

        // the extension is capped, so it still stops eventually
        assert!(policy
            .evaluate(&activity, burst_end + 46 * MINUTE)
            .should_stop());
    }

    #[test]
    fn test_required_idle_is_capped() {
        let policy = policy();
        assert_eq!(policy.required_idle(0.0), Some(30 * MINUTE));
        assert_eq!(policy.required_idle(1e9), Some(45 * MINUTE));
    }

    #[test]
    fn test_disabled_policy() {
        let start = Instant::now();
        let activity = ActivityState::new(start);
        assert_eq!(
            IdlePolicy::disabled().evaluate(&activity, start + 1000 * MINUTE),
            IdleDecision::Disabled
        );
    }

    #[test]
    fn test_last_activity_never_moves_backwards() {
        let start = Instant::now();
        let mut activity = ActivityState::new(start + MINUTE);
        activity.accept(start, Duration::from_secs(300));
        assert_eq!(activity.last_activity, start + MINUTE);
        activity.complete(start + 2 * MINUTE);
        assert_eq!(activity.last_activity, start + 2 * MINUTE);
        assert_eq!(activity.in_flight, 0);
    }
}
