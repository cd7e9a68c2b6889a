//! Entity Store contract.
//!
//! The orchestrator's only coordination primitive is the
//! version-conditioned write: every read returns `(value, version)`, every
//! update carries the version it last observed, and a stale version is a
//! first-class [`StoreError::Conflict`] — expected, retryable, and distinct
//! from every other failure. There are no locks anywhere above this
//! contract.
//!
//! Multi-entity effects that must be visible all-or-nothing (e.g. the four
//! writes a worker-running report produces) go through [`WriteBatch`] /
//! [`EntityStore::commit`], which applies atomically: a version conflict on
//! any entry aborts the whole batch.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgStore, PgStoreConfig};

use async_trait::async_trait;
use fleet_id::{JobId, MachineId, ScalesetId, TaskId};
use fleet_lifecycle::{JobState, NodeState, TaskState};
use thiserror::Error;

use crate::model::{Job, Node, NodeTask, Pool, Scaleset, Task, TaskEventRecord};

/// Opaque version token carried by every stored entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(pub u64);

impl Version {
    /// The version assigned to a freshly inserted entity.
    pub const FIRST: Self = Self(1);

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored value together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Version,
}

impl<T> Versioned<T> {
    pub fn new(value: T, version: Version) -> Self {
        Self { value, version }
    }

    /// Produces an updated copy carrying the same observed version, ready
    /// to be passed to a conditional write.
    pub fn with_value(&self, value: T) -> Self {
        Self {
            value,
            version: self.version,
        }
    }
}

/// Store operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The caller's version was stale; another writer got there first.
    /// Expected under concurrency — re-read and retry.
    #[error("version conflict on {entity}")]
    Conflict { entity: &'static str },

    /// The entity does not exist.
    #[error("{entity} not found")]
    NotFound { entity: &'static str },

    /// Insert of an entity that already exists.
    #[error("{entity} already exists")]
    AlreadyExists { entity: &'static str },

    /// Payload (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backing database failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// True for the retryable optimistic-concurrency outcome.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Selector for deleting node-task assignment rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeTaskSelector {
    ByTask(TaskId),
    ByNode(MachineId),
}

/// A set of writes applied atomically.
///
/// Entity updates are version-conditioned; upserts, deletes, and audit
/// appends are unconditional. If any conditioned entry conflicts, nothing
/// in the batch is applied.
#[derive(Debug, Default)]
pub struct WriteBatch {
    pub tasks: Vec<Versioned<Task>>,
    pub jobs: Vec<Versioned<Job>>,
    pub nodes: Vec<Versioned<Node>>,
    pub scalesets: Vec<Versioned<Scaleset>>,
    pub node_task_upserts: Vec<NodeTask>,
    pub node_task_deletes: Vec<NodeTaskSelector>,
    pub task_events: Vec<TaskEventRecord>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_task(mut self, task: Versioned<Task>) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn update_job(mut self, job: Versioned<Job>) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn update_node(mut self, node: Versioned<Node>) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn update_scaleset(mut self, scaleset: Versioned<Scaleset>) -> Self {
        self.scalesets.push(scaleset);
        self
    }

    pub fn upsert_node_task(mut self, node_task: NodeTask) -> Self {
        self.node_task_upserts.push(node_task);
        self
    }

    pub fn delete_node_tasks(mut self, selector: NodeTaskSelector) -> Self {
        self.node_task_deletes.push(selector);
        self
    }

    pub fn append_task_event(mut self, record: TaskEventRecord) -> Self {
        self.task_events.push(record);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
            && self.jobs.is_empty()
            && self.nodes.is_empty()
            && self.scalesets.is_empty()
            && self.node_task_upserts.is_empty()
            && self.node_task_deletes.is_empty()
            && self.task_events.is_empty()
    }
}

/// Durable keyed storage for all orchestrator entities.
///
/// Implementations must guarantee:
/// - reads return the latest committed version
/// - conditional writes reject stale versions with [`StoreError::Conflict`]
/// - [`EntityStore::commit`] is atomic as observed by subsequent reads
#[async_trait]
pub trait EntityStore: Send + Sync {
    // --- jobs ---

    async fn insert_job(&self, job: Job) -> Result<Versioned<Job>, StoreError>;
    async fn get_job(&self, job_id: JobId) -> Result<Option<Versioned<Job>>, StoreError>;
    async fn update_job(&self, job: Versioned<Job>) -> Result<Versioned<Job>, StoreError>;
    async fn list_jobs_by_state(&self, states: &[JobState])
        -> Result<Vec<Versioned<Job>>, StoreError>;

    // --- tasks ---

    async fn insert_task(&self, task: Task) -> Result<Versioned<Task>, StoreError>;
    async fn get_task(&self, task_id: TaskId) -> Result<Option<Versioned<Task>>, StoreError>;
    async fn update_task(&self, task: Versioned<Task>) -> Result<Versioned<Task>, StoreError>;
    async fn list_tasks_by_state(
        &self,
        states: &[TaskState],
    ) -> Result<Vec<Versioned<Task>>, StoreError>;
    async fn list_tasks_by_job(&self, job_id: JobId) -> Result<Vec<Versioned<Task>>, StoreError>;

    // --- pools ---

    async fn insert_pool(&self, pool: Pool) -> Result<Versioned<Pool>, StoreError>;
    async fn get_pool(&self, name: &str) -> Result<Option<Versioned<Pool>>, StoreError>;
    async fn list_pools(&self) -> Result<Vec<Versioned<Pool>>, StoreError>;
    async fn delete_pool(&self, name: &str) -> Result<(), StoreError>;

    // --- scalesets ---

    async fn insert_scaleset(&self, scaleset: Scaleset) -> Result<Versioned<Scaleset>, StoreError>;
    async fn get_scaleset(
        &self,
        scaleset_id: ScalesetId,
    ) -> Result<Option<Versioned<Scaleset>>, StoreError>;
    async fn update_scaleset(
        &self,
        scaleset: Versioned<Scaleset>,
    ) -> Result<Versioned<Scaleset>, StoreError>;
    async fn list_scalesets_by_pool(
        &self,
        pool_name: &str,
    ) -> Result<Vec<Versioned<Scaleset>>, StoreError>;

    // --- nodes ---

    async fn insert_node(&self, node: Node) -> Result<Versioned<Node>, StoreError>;
    async fn get_node(&self, machine_id: MachineId)
        -> Result<Option<Versioned<Node>>, StoreError>;
    async fn update_node(&self, node: Versioned<Node>) -> Result<Versioned<Node>, StoreError>;
    async fn delete_node(&self, machine_id: MachineId) -> Result<(), StoreError>;
    /// Nodes in any of the given states, optionally restricted to a pool.
    async fn list_nodes_by_state(
        &self,
        pool_name: Option<&str>,
        states: &[NodeState],
    ) -> Result<Vec<Versioned<Node>>, StoreError>;

    // --- node-task assignments ---

    async fn list_node_tasks_by_task(&self, task_id: TaskId)
        -> Result<Vec<NodeTask>, StoreError>;
    async fn list_node_tasks_by_node(
        &self,
        machine_id: MachineId,
    ) -> Result<Vec<NodeTask>, StoreError>;

    // --- task event audit log ---

    async fn list_task_events(&self, task_id: TaskId)
        -> Result<Vec<TaskEventRecord>, StoreError>;

    // --- atomic multi-entity writes ---

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;
}
