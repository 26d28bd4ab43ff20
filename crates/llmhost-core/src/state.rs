//! Lifecycle states of a model backend
//!
//! A backend moves `Stopped -> Starting -> Running -> Stopping -> Stopped`.
//! `Failed` is entered when a launch or probe fails and is left as soon as the
//! lease and process have been cleaned up, so it is never observed for long.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl LifecycleState {
    /// Whether the supervisor permits moving from `self` to `next`
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;

        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
                | (Failed, Stopped)
        )
    }

    /// A process may exist and hold a lease
    pub fn holds_resources(self) -> bool {
        !matches!(self, LifecycleState::Stopped)
    }

    /// Requests can be forwarded
    pub fn is_serving(self) -> bool {
        matches!(self, LifecycleState::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Failed => "failed",
        }
    }
}

impl Default for LifecycleState {
    fn default() -> Self {
        LifecycleState::Stopped
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
