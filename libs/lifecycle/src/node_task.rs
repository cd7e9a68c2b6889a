//! Node-task assignment lifecycle.
//!
//! A NodeTask record exists only while a task occupies a node: created as
//! `Scheduled` when the scheduler claims the node, flipped to `Running` by
//! the reconciler on the agent's running report, and deleted when the task
//! leaves the node.

use serde::{Deserialize, Serialize};

/// Assignment states, in order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum NodeTaskState {
    /// The scheduler has claimed the node for the task.
    #[default]
    Scheduled,
    /// The worker process is executing on the node.
    Running,
}

impl NodeTaskState {
    /// Assignments only move forward; a running assignment never reverts.
    pub fn can_transition_to(&self, next: NodeTaskState) -> bool {
        next > *self
    }
}

impl std::fmt::Display for NodeTaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeTaskState::Scheduled => write!(f, "scheduled"),
            NodeTaskState::Running => write!(f, "running"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_only() {
        assert!(NodeTaskState::Scheduled.can_transition_to(NodeTaskState::Running));
        assert!(!NodeTaskState::Running.can_transition_to(NodeTaskState::Scheduled));
        assert!(!NodeTaskState::Running.can_transition_to(NodeTaskState::Running));
    }
}
