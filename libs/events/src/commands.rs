//! Commands the orchestrator queues to node agents.

use fleet_id::{JobId, TaskId};
use serde::{Deserialize, Serialize};

/// A work assignment: the reference the agent needs to fetch and run a
/// task. The full task configuration is resolved by the agent out of band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkAssignment {
    pub job_id: JobId,
    pub task_id: TaskId,
}

/// Orders the agent to stop all work and shut the node down. The node's
/// record does not advance past idle until the agent confirms through its
/// normal state reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopNodeCommand {}

/// The command union queued to a node's agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCommand {
    RunTask(WorkAssignment),
    StopNode(StopNodeCommand),
}

impl NodeCommand {
    pub fn stop_node() -> Self {
        NodeCommand::StopNode(StopNodeCommand {})
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, NodeCommand::StopNode(_))
    }
}
