//! Entity model for the orchestrator's bookkeeping state.
//!
//! These records are what the Entity Store persists. Lifecycle states come
//! from `fleet-lifecycle`; this module only adds the surrounding data.

use chrono::{DateTime, Duration, Utc};
use fleet_events::WorkerEvent;
use fleet_id::{JobId, MachineId, PoolId, ScalesetId, TaskId};
use fleet_lifecycle::{
    JobState, NodeFlags, NodeState, NodeTaskState, ScalesetState, TaskError, TaskState,
};
use serde::{Deserialize, Serialize};

// =============================================================================
// Operating System
// =============================================================================

/// The OS a pool's nodes run. Part of a pool's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Os {
    Linux,
    Windows,
}

impl std::fmt::Display for Os {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Os::Linux => write!(f, "linux"),
            Os::Windows => write!(f, "windows"),
        }
    }
}

// =============================================================================
// Jobs
// =============================================================================

/// User-supplied job settings, immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    pub project: String,
    pub name: String,
    pub build: String,
    /// Runtime budget; the job is stopped once this elapses.
    pub duration_hours: u32,
}

/// A logical grouping of tasks sharing a project/name/build and a runtime
/// budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub state: JobState,
    pub config: JobConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(config: JobConfig) -> Self {
        Self {
            job_id: JobId::new(),
            state: JobState::Init,
            config,
            error: None,
            created_at: Utc::now(),
            end_time: None,
        }
    }

    /// The instant the job's runtime budget runs out.
    pub fn budget_deadline(&self) -> DateTime<Utc> {
        self.created_at + Duration::hours(i64::from(self.config.duration_hours))
    }
}

// =============================================================================
// Tasks
// =============================================================================

/// The kind of work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Fuzz,
    Coverage,
    CrashReport,
    Regression,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskType::Fuzz => "fuzz",
            TaskType::Coverage => "coverage",
            TaskType::CrashReport => "crash_report",
            TaskType::Regression => "regression",
        };
        write!(f, "{}", s)
    }
}

/// Immutable task settings fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub task_type: TaskType,
    /// The pool whose nodes may run this task.
    pub pool_name: String,
    /// Reference to the target executable inside the task's containers.
    pub target_exe: String,
    #[serde(default)]
    pub target_options: Vec<String>,
    /// Resource container references (corpus, crashes, coverage, ...).
    #[serde(default)]
    pub containers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_timeout_secs: Option<u64>,
    /// Retry budget for transient worker failures.
    #[serde(default)]
    pub check_retry_count: u32,
    /// Tasks in the same job that must be running before this one starts.
    /// If one of them fails, this task fails with it.
    #[serde(default)]
    pub prereq_tasks: Vec<TaskId>,
}

/// One schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub state: TaskState,
    pub config: TaskConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(job_id: JobId, config: TaskConfig) -> Self {
        Self {
            task_id: TaskId::new(),
            job_id,
            state: TaskState::Init,
            config,
            error: None,
            created_at: Utc::now(),
            end_time: None,
        }
    }
}

// =============================================================================
// Pools and Scalesets
// =============================================================================

/// A named, OS-typed logical capacity group. Name + OS is unique and
/// immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub pool_id: PoolId,
    pub name: String,
    pub os: Os,
    /// Managed pools have their scalesets sized by the scheduler.
    pub managed: bool,
    pub created_at: DateTime<Utc>,
}

impl Pool {
    pub fn new(name: impl Into<String>, os: Os, managed: bool) -> Self {
        Self {
            pool_id: PoolId::new(),
            name: name.into(),
            os,
            managed,
            created_at: Utc::now(),
        }
    }
}

/// A homogeneous group of nodes backing one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scaleset {
    pub scaleset_id: ScalesetId,
    pub pool_name: String,
    pub state: ScalesetState,
    /// Target node count; the backend converges actual capacity to this.
    pub size: u64,
    pub image: String,
    pub region: String,
    pub created_at: DateTime<Utc>,
}

impl Scaleset {
    pub fn new(
        pool_name: impl Into<String>,
        size: u64,
        image: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            scaleset_id: ScalesetId::new(),
            pool_name: pool_name.into(),
            state: ScalesetState::Init,
            size,
            image: image.into(),
            region: region.into(),
            created_at: Utc::now(),
        }
    }
}

// =============================================================================
// Nodes
// =============================================================================

/// One compute instance, capable of running at most one task at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub machine_id: MachineId,
    pub pool_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scaleset_id: Option<ScalesetId>,
    pub state: NodeState,
    /// Deferred: takes effect the next time the node is idle.
    #[serde(default)]
    pub reimage_requested: bool,
    /// Deferred: takes effect the next time the node is idle.
    #[serde(default)]
    pub delete_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

impl Node {
    pub fn new(machine_id: MachineId, pool_name: impl Into<String>) -> Self {
        Self {
            machine_id,
            pool_name: pool_name.into(),
            scaleset_id: None,
            state: NodeState::Init,
            reimage_requested: false,
            delete_requested: false,
            heartbeat: None,
            registered_at: Utc::now(),
        }
    }

    pub fn flags(&self) -> NodeFlags {
        NodeFlags {
            reimage_requested: self.reimage_requested,
            delete_requested: self.delete_requested,
        }
    }

    /// A node is schedulable only when ready and not marked for teardown.
    pub fn can_accept_work(&self) -> bool {
        self.state.can_schedule() && !self.flags().teardown_requested()
    }
}

// =============================================================================
// Node-Task Assignments
// =============================================================================

/// The current (node, task) assignment. Exists only while a task occupies
/// a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTask {
    pub machine_id: MachineId,
    pub task_id: TaskId,
    pub state: NodeTaskState,
}

// =============================================================================
// Task Event Audit Records
// =============================================================================

/// Append-only audit entry for each worker event received, whether or not
/// it changed any state. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEventRecord {
    pub task_id: TaskId,
    pub machine_id: MachineId,
    pub event: WorkerEvent,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_budget_deadline() {
        let job = Job::new(JobConfig {
            project: "proj".into(),
            name: "fuzzing".into(),
            build: "1".into(),
            duration_hours: 24,
        });
        assert_eq!(job.budget_deadline() - job.created_at, Duration::hours(24));
    }

    #[test]
    fn test_new_task_starts_in_init() {
        let task = Task::new(
            JobId::new(),
            TaskConfig {
                task_type: TaskType::Fuzz,
                pool_name: "linux-fuzzing".into(),
                target_exe: "fuzz.exe".into(),
                target_options: vec![],
                containers: vec!["corpus".into()],
                task_timeout_secs: None,
                check_retry_count: 0,
                prereq_tasks: vec![],
            },
        );
        assert_eq!(task.state, TaskState::Init);
        assert!(task.error.is_none());
    }

    #[test]
    fn test_node_can_accept_work() {
        let mut node = Node::new(MachineId::new(), "linux-fuzzing");
        assert!(!node.can_accept_work());

        node.state = NodeState::Ready;
        assert!(node.can_accept_work());

        node.reimage_requested = true;
        assert!(!node.can_accept_work());
    }

    #[test]
    fn test_task_config_decode_defaults() {
        let json = serde_json::json!({
            "task_type": "fuzz",
            "pool_name": "linux-fuzzing",
            "target_exe": "bin/target",
        });
        let config: TaskConfig = serde_json::from_value(json).unwrap();
        assert!(config.containers.is_empty());
        assert!(config.prereq_tasks.is_empty());
        assert_eq!(config.check_retry_count, 0);
    }
}
