//! Job lifecycle state machine.
//!
//! Jobs are the user-level grouping of tasks:
//! `Init → Enabled → Stopping → Stopped`, forward-only. A job enters
//! `Stopping` when its runtime budget elapses, when the user stops it, or
//! when every task has finished; it becomes `Stopped` once all its tasks
//! are stopped.

use serde::{Deserialize, Serialize};

/// Job lifecycle states, in transition order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Created; tasks may still be added.
    #[default]
    Init,
    /// Active; its tasks are schedulable.
    Enabled,
    /// Stop requested; tasks are winding down.
    Stopping,
    /// All tasks stopped. Frozen.
    Stopped,
}

impl JobState {
    /// States in which the job's tasks may still be scheduled.
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Init | JobState::Enabled)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, JobState::Stopped)
    }

    /// Jobs only move forward in the lifecycle order.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        next > *self
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Init => "init",
            JobState::Enabled => "enabled",
            JobState::Stopping => "stopping",
            JobState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}
