//! Agent-reported event payloads and notification event types.

use fleet_id::TaskId;
use fleet_lifecycle::NodeState;
use serde::{Deserialize, Serialize};

// =============================================================================
// Notification Event Types
// =============================================================================

/// Event type names emitted to the (external) notification layer when an
/// entity reaches a terminal state.
pub mod event_types {
    pub const JOB_STOPPED: &str = "job.stopped";
    pub const TASK_STOPPED: &str = "task.stopped";
    pub const TASK_FAILED: &str = "task.failed";
    pub const NODE_STATE_CHANGED: &str = "node.state_changed";
    pub const SCALESET_RESIZED: &str = "scaleset.resized";
}

// =============================================================================
// Worker Events
// =============================================================================

/// Exit status reported by the agent for a finished worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    pub success: bool,
}

/// Payload of a worker "running" report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRunningEvent {
    pub task_id: TaskId,
}

/// Payload of a worker "done" report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerDoneEvent {
    pub task_id: TaskId,
    pub exit_status: ExitStatus,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub stdout: String,
}

/// Task progress reported by the agent.
///
/// Exactly one variant per event — a payload naming neither (or both) does
/// not decode, which is what keeps malformed reports out of the state
/// machines entirely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerEvent {
    Running(WorkerRunningEvent),
    Done(WorkerDoneEvent),
}

impl WorkerEvent {
    /// The task this report is about.
    pub fn task_id(&self) -> TaskId {
        match self {
            WorkerEvent::Running(e) => e.task_id,
            WorkerEvent::Done(e) => e.task_id,
        }
    }
}

// =============================================================================
// Node State Updates
// =============================================================================

/// Agent-reported node lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStateUpdate {
    pub state: NodeState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_running_event_decodes() {
        let json = r#"{"running": {"task_id": "9d2c96ae-3b54-4a11-9d9f-36a3e939bc26"}}"#;
        let event: WorkerEvent = serde_json::from_str(json).unwrap();
        assert!(matches!(event, WorkerEvent::Running(_)));
    }

    #[test]
    fn test_worker_done_event_decodes() {
        let json = r#"{
            "done": {
                "task_id": "9d2c96ae-3b54-4a11-9d9f-36a3e939bc26",
                "exit_status": {"code": 1, "success": false},
                "stderr": "panic",
                "stdout": ""
            }
        }"#;
        let event: WorkerEvent = serde_json::from_str(json).unwrap();
        let WorkerEvent::Done(done) = event else {
            panic!("expected done event");
        };
        assert_eq!(done.exit_status.code, Some(1));
        assert!(!done.exit_status.success);
        assert_eq!(done.stderr, "panic");
    }

    #[test]
    fn test_worker_event_with_neither_variant_rejected() {
        // Neither "running" nor "done": must fail at decode time.
        let json = r#"{"task_id": "9d2c96ae-3b54-4a11-9d9f-36a3e939bc26"}"#;
        assert!(serde_json::from_str::<WorkerEvent>(json).is_err());
    }

    #[test]
    fn test_done_event_defaults_output_streams() {
        let json = r#"{
            "done": {
                "task_id": "9d2c96ae-3b54-4a11-9d9f-36a3e939bc26",
                "exit_status": {"code": 0, "success": true}
            }
        }"#;
        let event: WorkerEvent = serde_json::from_str(json).unwrap();
        let WorkerEvent::Done(done) = event else {
            panic!("expected done event");
        };
        assert!(done.stderr.is_empty());
        assert!(done.stdout.is_empty());
    }

    #[test]
    fn test_node_state_update_decodes() {
        let json = r#"{"state": "ready"}"#;
        let update: NodeStateUpdate = serde_json::from_str(json).unwrap();
        assert_eq!(update.state, NodeState::Ready);
    }
}
