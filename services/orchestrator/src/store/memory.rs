//! In-memory Entity Store.
//!
//! Backs tests and dev mode. One mutex around the whole keyspace keeps
//! `commit` trivially atomic; version checks behave exactly like the
//! Postgres implementation so concurrency bugs show up in tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use fleet_id::{JobId, MachineId, ScalesetId, TaskId};
use fleet_lifecycle::{JobState, NodeState, TaskState};

use crate::model::{Job, Node, NodeTask, Pool, Scaleset, Task, TaskEventRecord};

use super::{
    EntityStore, NodeTaskSelector, StoreError, Version, Versioned, WriteBatch,
};

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Versioned<Job>>,
    tasks: HashMap<TaskId, Versioned<Task>>,
    pools: HashMap<String, Versioned<Pool>>,
    scalesets: HashMap<ScalesetId, Versioned<Scaleset>>,
    nodes: HashMap<MachineId, Versioned<Node>>,
    node_tasks: HashMap<(MachineId, TaskId), NodeTask>,
    task_events: Vec<TaskEventRecord>,
}

impl Inner {
    /// Checks every version-conditioned entry in the batch before anything
    /// is written, so a conflict aborts with no partial application.
    fn check_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        for job in &batch.jobs {
            check_version(self.jobs.get(&job.value.job_id), job.version, "job")?;
        }
        for task in &batch.tasks {
            check_version(self.tasks.get(&task.value.task_id), task.version, "task")?;
        }
        for node in &batch.nodes {
            check_version(self.nodes.get(&node.value.machine_id), node.version, "node")?;
        }
        for scaleset in &batch.scalesets {
            check_version(
                self.scalesets.get(&scaleset.value.scaleset_id),
                scaleset.version,
                "scaleset",
            )?;
        }
        Ok(())
    }

    fn apply_batch(&mut self, batch: WriteBatch) {
        for job in batch.jobs {
            self.jobs.insert(
                job.value.job_id,
                Versioned::new(job.value, job.version.next()),
            );
        }
        for task in batch.tasks {
            self.tasks.insert(
                task.value.task_id,
                Versioned::new(task.value, task.version.next()),
            );
        }
        for node in batch.nodes {
            self.nodes.insert(
                node.value.machine_id,
                Versioned::new(node.value, node.version.next()),
            );
        }
        for scaleset in batch.scalesets {
            self.scalesets.insert(
                scaleset.value.scaleset_id,
                Versioned::new(scaleset.value, scaleset.version.next()),
            );
        }
        for nt in batch.node_task_upserts {
            self.node_tasks.insert((nt.machine_id, nt.task_id), nt);
        }
        for selector in batch.node_task_deletes {
            match selector {
                NodeTaskSelector::ByTask(task_id) => {
                    self.node_tasks.retain(|(_, t), _| *t != task_id);
                }
                NodeTaskSelector::ByNode(machine_id) => {
                    self.node_tasks.retain(|(m, _), _| *m != machine_id);
                }
            }
        }
        self.task_events.extend(batch.task_events);
    }
}

fn check_version<T>(
    existing: Option<&Versioned<T>>,
    expected: Version,
    entity: &'static str,
) -> Result<(), StoreError> {
    match existing {
        Some(current) if current.version == expected => Ok(()),
        Some(_) => Err(StoreError::Conflict { entity }),
        None => Err(StoreError::NotFound { entity }),
    }
}

/// In-memory store; cheap to clone handles via `Arc` at the call site.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a panic mid-write; tests surface that.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn insert_job(&self, job: Job) -> Result<Versioned<Job>, StoreError> {
        let mut inner = self.lock();
        if inner.jobs.contains_key(&job.job_id) {
            return Err(StoreError::AlreadyExists { entity: "job" });
        }
        let stored = Versioned::new(job, Version::FIRST);
        inner.jobs.insert(stored.value.job_id, stored.clone());
        Ok(stored)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Versioned<Job>>, StoreError> {
        Ok(self.lock().jobs.get(&job_id).cloned())
    }

    async fn update_job(&self, job: Versioned<Job>) -> Result<Versioned<Job>, StoreError> {
        let mut inner = self.lock();
        check_version(inner.jobs.get(&job.value.job_id), job.version, "job")?;
        let stored = Versioned::new(job.value, job.version.next());
        inner.jobs.insert(stored.value.job_id, stored.clone());
        Ok(stored)
    }

    async fn list_jobs_by_state(
        &self,
        states: &[JobState],
    ) -> Result<Vec<Versioned<Job>>, StoreError> {
        let mut jobs: Vec<_> = self
            .lock()
            .jobs
            .values()
            .filter(|j| states.contains(&j.value.state))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.value.created_at, j.value.job_id));
        Ok(jobs)
    }

    async fn insert_task(&self, task: Task) -> Result<Versioned<Task>, StoreError> {
        let mut inner = self.lock();
        if inner.tasks.contains_key(&task.task_id) {
            return Err(StoreError::AlreadyExists { entity: "task" });
        }
        let stored = Versioned::new(task, Version::FIRST);
        inner.tasks.insert(stored.value.task_id, stored.clone());
        Ok(stored)
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<Versioned<Task>>, StoreError> {
        Ok(self.lock().tasks.get(&task_id).cloned())
    }

    async fn update_task(&self, task: Versioned<Task>) -> Result<Versioned<Task>, StoreError> {
        let mut inner = self.lock();
        check_version(inner.tasks.get(&task.value.task_id), task.version, "task")?;
        let stored = Versioned::new(task.value, task.version.next());
        inner.tasks.insert(stored.value.task_id, stored.clone());
        Ok(stored)
    }

    async fn list_tasks_by_state(
        &self,
        states: &[TaskState],
    ) -> Result<Vec<Versioned<Task>>, StoreError> {
        let mut tasks: Vec<_> = self
            .lock()
            .tasks
            .values()
            .filter(|t| states.contains(&t.value.state))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.value.created_at, t.value.task_id));
        Ok(tasks)
    }

    async fn list_tasks_by_job(&self, job_id: JobId) -> Result<Vec<Versioned<Task>>, StoreError> {
        let mut tasks: Vec<_> = self
            .lock()
            .tasks
            .values()
            .filter(|t| t.value.job_id == job_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.value.created_at, t.value.task_id));
        Ok(tasks)
    }

    async fn insert_pool(&self, pool: Pool) -> Result<Versioned<Pool>, StoreError> {
        let mut inner = self.lock();
        if inner.pools.contains_key(&pool.name) {
            return Err(StoreError::AlreadyExists { entity: "pool" });
        }
        let stored = Versioned::new(pool, Version::FIRST);
        inner.pools.insert(stored.value.name.clone(), stored.clone());
        Ok(stored)
    }

    async fn get_pool(&self, name: &str) -> Result<Option<Versioned<Pool>>, StoreError> {
        Ok(self.lock().pools.get(name).cloned())
    }

    async fn list_pools(&self) -> Result<Vec<Versioned<Pool>>, StoreError> {
        let mut pools: Vec<_> = self.lock().pools.values().cloned().collect();
        pools.sort_by(|a, b| a.value.name.cmp(&b.value.name));
        Ok(pools)
    }

    async fn delete_pool(&self, name: &str) -> Result<(), StoreError> {
        self.lock().pools.remove(name);
        Ok(())
    }

    async fn insert_scaleset(&self, scaleset: Scaleset) -> Result<Versioned<Scaleset>, StoreError> {
        let mut inner = self.lock();
        if inner.scalesets.contains_key(&scaleset.scaleset_id) {
            return Err(StoreError::AlreadyExists { entity: "scaleset" });
        }
        let stored = Versioned::new(scaleset, Version::FIRST);
        inner
            .scalesets
            .insert(stored.value.scaleset_id, stored.clone());
        Ok(stored)
    }

    async fn get_scaleset(
        &self,
        scaleset_id: ScalesetId,
    ) -> Result<Option<Versioned<Scaleset>>, StoreError> {
        Ok(self.lock().scalesets.get(&scaleset_id).cloned())
    }

    async fn update_scaleset(
        &self,
        scaleset: Versioned<Scaleset>,
    ) -> Result<Versioned<Scaleset>, StoreError> {
        let mut inner = self.lock();
        check_version(
            inner.scalesets.get(&scaleset.value.scaleset_id),
            scaleset.version,
            "scaleset",
        )?;
        let stored = Versioned::new(scaleset.value, scaleset.version.next());
        inner
            .scalesets
            .insert(stored.value.scaleset_id, stored.clone());
        Ok(stored)
    }

    async fn list_scalesets_by_pool(
        &self,
        pool_name: &str,
    ) -> Result<Vec<Versioned<Scaleset>>, StoreError> {
        let mut scalesets: Vec<_> = self
            .lock()
            .scalesets
            .values()
            .filter(|s| s.value.pool_name == pool_name)
            .cloned()
            .collect();
        scalesets.sort_by_key(|s| (s.value.created_at, s.value.scaleset_id));
        Ok(scalesets)
    }

    async fn insert_node(&self, node: Node) -> Result<Versioned<Node>, StoreError> {
        let mut inner = self.lock();
        if inner.nodes.contains_key(&node.machine_id) {
            return Err(StoreError::AlreadyExists { entity: "node" });
        }
        let stored = Versioned::new(node, Version::FIRST);
        inner.nodes.insert(stored.value.machine_id, stored.clone());
        Ok(stored)
    }

    async fn get_node(
        &self,
        machine_id: MachineId,
    ) -> Result<Option<Versioned<Node>>, StoreError> {
        Ok(self.lock().nodes.get(&machine_id).cloned())
    }

    async fn update_node(&self, node: Versioned<Node>) -> Result<Versioned<Node>, StoreError> {
        let mut inner = self.lock();
        check_version(inner.nodes.get(&node.value.machine_id), node.version, "node")?;
        let stored = Versioned::new(node.value, node.version.next());
        inner.nodes.insert(stored.value.machine_id, stored.clone());
        Ok(stored)
    }

    async fn delete_node(&self, machine_id: MachineId) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.nodes.remove(&machine_id);
        inner.node_tasks.retain(|(m, _), _| *m != machine_id);
        Ok(())
    }

    async fn list_nodes_by_state(
        &self,
        pool_name: Option<&str>,
        states: &[NodeState],
    ) -> Result<Vec<Versioned<Node>>, StoreError> {
        let mut nodes: Vec<_> = self
            .lock()
            .nodes
            .values()
            .filter(|n| states.contains(&n.value.state))
            .filter(|n| pool_name.is_none_or(|p| n.value.pool_name == p))
            .cloned()
            .collect();
        nodes.sort_by_key(|n| (n.value.registered_at, n.value.machine_id));
        Ok(nodes)
    }

    async fn list_node_tasks_by_task(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<NodeTask>, StoreError> {
        let mut node_tasks: Vec<_> = self
            .lock()
            .node_tasks
            .values()
            .filter(|nt| nt.task_id == task_id)
            .copied()
            .collect();
        node_tasks.sort_by_key(|nt| nt.machine_id);
        Ok(node_tasks)
    }

    async fn list_node_tasks_by_node(
        &self,
        machine_id: MachineId,
    ) -> Result<Vec<NodeTask>, StoreError> {
        let mut node_tasks: Vec<_> = self
            .lock()
            .node_tasks
            .values()
            .filter(|nt| nt.machine_id == machine_id)
            .copied()
            .collect();
        node_tasks.sort_by_key(|nt| nt.task_id);
        Ok(node_tasks)
    }

    async fn list_task_events(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<TaskEventRecord>, StoreError> {
        Ok(self
            .lock()
            .task_events
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check_batch(&batch)?;
        inner.apply_batch(batch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobConfig, TaskConfig, TaskType};

    fn sample_job() -> Job {
        Job::new(JobConfig {
            project: "proj".into(),
            name: "fuzzing".into(),
            build: "1".into(),
            duration_hours: 1,
        })
    }

    fn sample_task(job_id: JobId) -> Task {
        Task::new(
            job_id,
            TaskConfig {
                task_type: TaskType::Fuzz,
                pool_name: "linux".into(),
                target_exe: "bin/t".into(),
                target_options: vec![],
                containers: vec![],
                task_timeout_secs: None,
                check_retry_count: 0,
                prereq_tasks: vec![],
            },
        )
    }

    #[tokio::test]
    async fn test_insert_and_get_roundtrip() {
        let store = MemoryStore::new();
        let job = sample_job();
        let job_id = job.job_id;
        let stored = store.insert_job(job).await.unwrap();
        assert_eq!(stored.version, Version::FIRST);

        let fetched = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(fetched, stored);
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = MemoryStore::new();
        let stored = store.insert_job(sample_job()).await.unwrap();

        // First writer wins and bumps the version.
        let first = store.update_job(stored.clone()).await.unwrap();
        assert_eq!(first.version, stored.version.next());

        // Second writer still holds the old version.
        let err = store.update_job(stored).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_commit_is_all_or_nothing() {
        let store = MemoryStore::new();
        let job = store.insert_job(sample_job()).await.unwrap();
        let task = store.insert_task(sample_task(job.value.job_id)).await.unwrap();

        // Invalidate the job version, keep the task version fresh.
        let _ = store.update_job(job.clone()).await.unwrap();

        let mut bumped_task = task.value.clone();
        bumped_task.state = fleet_lifecycle::TaskState::Scheduled;
        let batch = WriteBatch::new()
            .update_job(job)
            .update_task(task.with_value(bumped_task));

        let err = store.commit(batch).await.unwrap_err();
        assert!(err.is_conflict());

        // The task write must not have been applied.
        let fetched = store.get_task(task.value.task_id).await.unwrap().unwrap();
        assert_eq!(fetched.value.state, fleet_lifecycle::TaskState::Init);
        assert_eq!(fetched.version, task.version);
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = MemoryStore::new();
        let job = sample_job();
        store.insert_job(job.clone()).await.unwrap();
        let err = store.insert_job(job).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }
}
