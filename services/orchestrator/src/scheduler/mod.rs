//! Task assignment and capacity sizing.
//!
//! The scheduler is a periodic control loop, not an event handler: every
//! tick it matches `Scheduled` tasks to `Ready` nodes and converges each
//! managed pool's scaleset targets to the outstanding work. Assignment
//! races between concurrent scheduler instances are resolved by the node's
//! version-conditioned claim — the loser sees a conflict, treats the node
//! as unavailable, and retries on the next tick.

mod worker;

pub use worker::SchedulerWorker;

use std::sync::Arc;

use fleet_events::{event_types, NodeCommand, WorkAssignment};
use fleet_lifecycle::{task, NodeState, NodeTaskState, ScalesetState, TaskSignal, TaskState};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::capacity::{CapacityBackend, CapacityError, PoolUtilization};
use crate::model::{NodeTask, Pool, Task};
use crate::queue::{enqueue_message, node_command_queue, QueueError, WorkQueue};
use crate::store::{EntityStore, StoreError, Versioned, WriteBatch};

/// Scheduling errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("capacity backend error: {0}")]
    Capacity(#[from] CapacityError),
}

/// Statistics from one scheduling pass.
#[derive(Debug, Default, Clone)]
pub struct SchedulerStats {
    pub tasks_assigned: u32,
    pub tasks_waiting: u32,
    pub assignment_conflicts: u32,
    pub pools_resized: u32,
    pub nodes_marked_for_removal: u32,
}

impl SchedulerStats {
    pub fn changed_anything(&self) -> bool {
        self.tasks_assigned > 0 || self.pools_resized > 0 || self.nodes_marked_for_removal > 0
    }
}

/// Outcome of trying to place one task.
enum Assignment {
    Assigned,
    NoCapacity,
    NotEligible,
    Lost,
}

/// The periodic scheduling core.
pub struct Scheduler {
    store: Arc<dyn EntityStore>,
    queue: Arc<dyn WorkQueue>,
    capacity: Arc<dyn CapacityBackend>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn EntityStore>,
        queue: Arc<dyn WorkQueue>,
        capacity: Arc<dyn CapacityBackend>,
    ) -> Self {
        Self {
            store,
            queue,
            capacity,
        }
    }

    /// Run a single scheduling pass.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<SchedulerStats, SchedulerError> {
        let mut stats = SchedulerStats::default();
        self.assign_tasks(&mut stats).await?;
        self.resize_pools(&mut stats).await?;
        Ok(stats)
    }

    /// Match `Scheduled` tasks to `Ready` nodes, first-fit within the
    /// task's pool. A task that finds no node stays `Scheduled` and is
    /// retried next tick.
    async fn assign_tasks(&self, stats: &mut SchedulerStats) -> Result<(), SchedulerError> {
        let tasks = self.store.list_tasks_by_state(&[TaskState::Scheduled]).await?;

        for task in tasks {
            let task_id = task.value.task_id;
            match self.assign_task(&task).await {
                Ok(Assignment::Assigned) => stats.tasks_assigned += 1,
                Ok(Assignment::NoCapacity) | Ok(Assignment::NotEligible) => {
                    stats.tasks_waiting += 1
                }
                Ok(Assignment::Lost) => stats.assignment_conflicts += 1,
                Err(e) => {
                    // One bad task must not stall the rest of the pass.
                    warn!(task_id = %task_id, error = %e, "Failed to assign task");
                }
            }
        }
        Ok(())
    }

    async fn assign_task(&self, task: &Versioned<Task>) -> Result<Assignment, SchedulerError> {
        if !self.eligible_to_run(&task.value).await? {
            return Ok(Assignment::NotEligible);
        }

        let nodes = self
            .store
            .list_nodes_by_state(Some(&task.value.config.pool_name), &[NodeState::Ready])
            .await?;
        let Some(node) = nodes.into_iter().find(|n| n.value.can_accept_work()) else {
            debug!(
                task_id = %task.value.task_id,
                pool = %task.value.config.pool_name,
                "No ready node available"
            );
            return Ok(Assignment::NoCapacity);
        };

        let Ok(transition) = task::apply(task.value.state, TaskSignal::Assigned) else {
            // The task moved on since we listed it.
            return Ok(Assignment::Lost);
        };

        let machine_id = node.value.machine_id;
        let mut claimed = node.value.clone();
        claimed.state = NodeState::Busy;
        let mut updated_task = task.value.clone();
        updated_task.state = transition.state;

        let batch = WriteBatch::new()
            .update_node(node.with_value(claimed))
            .update_task(task.with_value(updated_task))
            .upsert_node_task(NodeTask {
                machine_id,
                task_id: task.value.task_id,
                state: NodeTaskState::Scheduled,
            });

        match self.store.commit(batch).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                debug!(
                    task_id = %task.value.task_id,
                    machine_id = %machine_id,
                    "Lost assignment race, will retry next tick"
                );
                return Ok(Assignment::Lost);
            }
            Err(e) => return Err(e.into()),
        }

        // The command goes out only after the claim has landed; the queue
        // is at-least-once, so the write never outruns the work.
        enqueue_message(
            self.queue.as_ref(),
            &node_command_queue(machine_id),
            &NodeCommand::RunTask(WorkAssignment {
                job_id: task.value.job_id,
                task_id: task.value.task_id,
            }),
        )
        .await?;

        info!(
            task_id = %task.value.task_id,
            machine_id = %machine_id,
            pool = %task.value.config.pool_name,
            "Assigned task to node"
        );
        Ok(Assignment::Assigned)
    }

    /// A task runs only while its job is live and after every prerequisite
    /// has reached `Running` (or finished cleanly).
    async fn eligible_to_run(&self, task: &Task) -> Result<bool, SchedulerError> {
        if let Some(job) = self.store.get_job(task.job_id).await? {
            if !job.value.state.is_active() {
                return Ok(false);
            }
        }

        for prereq_id in &task.config.prereq_tasks {
            let satisfied = match self.store.get_task(*prereq_id).await? {
                Some(prereq) => {
                    prereq.value.state == TaskState::Running
                        || (prereq.value.state > TaskState::Running
                            && prereq.value.error.is_none())
                }
                None => false,
            };
            if !satisfied {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Converge each managed pool's capacity to its outstanding work.
    async fn resize_pools(&self, stats: &mut SchedulerStats) -> Result<(), SchedulerError> {
        let pools = self.store.list_pools().await?;
        for pool in pools {
            if !pool.value.managed {
                continue;
            }
            if let Err(e) = self.resize_pool(&pool.value, stats).await {
                warn!(pool = %pool.value.name, error = %e, "Failed to resize pool");
            }
        }
        Ok(())
    }

    async fn resize_pool(
        &self,
        pool: &Pool,
        stats: &mut SchedulerStats,
    ) -> Result<(), SchedulerError> {
        let utilization = self.observe_pool(pool).await?;
        let delta = utilization.node_delta();

        if delta > 0 {
            if self.grow_pool(pool, delta as u64).await? {
                stats.pools_resized += 1;
            }
        } else if delta < 0 {
            let marked = self.shrink_pool(pool, (-delta) as u64).await?;
            stats.nodes_marked_for_removal += marked;
            if marked > 0 {
                stats.pools_resized += 1;
            }
        }
        Ok(())
    }

    async fn observe_pool(&self, pool: &Pool) -> Result<PoolUtilization, SchedulerError> {
        let outstanding_tasks = self
            .store
            .list_tasks_by_state(&[
                TaskState::Scheduled,
                TaskState::SettingUp,
                TaskState::Running,
            ])
            .await?
            .iter()
            .filter(|t| t.value.config.pool_name == pool.name)
            .count();

        let target_capacity: u64 = self
            .store
            .list_scalesets_by_pool(&pool.name)
            .await?
            .iter()
            .filter(|s| !s.value.state.is_shutting_down())
            .map(|s| s.value.size)
            .sum();

        let nodes = self
            .store
            .list_nodes_by_state(
                Some(&pool.name),
                &[
                    NodeState::Init,
                    NodeState::SettingUp,
                    NodeState::Ready,
                    NodeState::Busy,
                    NodeState::Free,
                    NodeState::Done,
                ],
            )
            .await?;
        let pending_teardown = nodes
            .iter()
            .filter(|n| n.value.flags().teardown_requested())
            .count();
        let ready_nodes = nodes.iter().filter(|n| n.value.can_accept_work()).count();

        Ok(PoolUtilization {
            outstanding_tasks,
            target_capacity,
            pending_teardown,
            ready_nodes,
        })
    }

    /// Raise a scaleset target. The backend provisions asynchronously; the
    /// raised target keeps the next tick from growing again while machines
    /// boot.
    async fn grow_pool(&self, pool: &Pool, add: u64) -> Result<bool, SchedulerError> {
        let scalesets = self.store.list_scalesets_by_pool(&pool.name).await?;
        let Some(scaleset) = scalesets.into_iter().find(|s| {
            matches!(
                s.value.state,
                ScalesetState::Running | ScalesetState::Resize
            )
        }) else {
            debug!(pool = %pool.name, "No resizable scaleset, growth deferred");
            return Ok(false);
        };

        let mut resized = scaleset.value.clone();
        resized.size += add;
        if resized.state.can_transition_to(ScalesetState::Resize) {
            resized.state = ScalesetState::Resize;
        }

        match self.store.update_scaleset(scaleset.with_value(resized.clone())).await {
            Ok(updated) => {
                self.capacity
                    .set_capacity(resized.scaleset_id, resized.size)
                    .await?;
                // Target accepted; the scaleset is stable again from the
                // scheduler's point of view.
                let mut settled = updated.value.clone();
                if settled.state.can_transition_to(ScalesetState::Running) {
                    settled.state = ScalesetState::Running;
                    if let Err(e) = self.store.update_scaleset(updated.with_value(settled)).await {
                        if !e.is_conflict() {
                            return Err(e.into());
                        }
                    }
                }
                info!(
                    event_type = event_types::SCALESET_RESIZED,
                    scaleset_id = %resized.scaleset_id,
                    pool = %pool.name,
                    size = resized.size,
                    "Grew scaleset"
                );
                Ok(true)
            }
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Mark idle nodes for removal. Scale-down never touches a busy node:
    /// only `Ready` nodes are flagged, and the janitor reclaims them after
    /// their agents confirm shutdown.
    async fn shrink_pool(&self, pool: &Pool, drop: u64) -> Result<u32, SchedulerError> {
        let ready = self
            .store
            .list_nodes_by_state(Some(&pool.name), &[NodeState::Ready])
            .await?;

        let mut marked = 0u32;
        for node in ready
            .into_iter()
            .filter(|n| n.value.can_accept_work())
            .take(drop as usize)
        {
            let machine_id = node.value.machine_id;
            let mut flagged = node.value.clone();
            flagged.delete_requested = true;

            match self.store.update_node(node.with_value(flagged)).await {
                Ok(_) => {
                    // Idle already, so the stop goes out immediately.
                    enqueue_message(
                        self.queue.as_ref(),
                        &node_command_queue(machine_id),
                        &NodeCommand::stop_node(),
                    )
                    .await?;
                    info!(machine_id = %machine_id, pool = %pool.name, "Marked node for removal");
                    marked += 1;
                }
                Err(e) if e.is_conflict() => {
                    // The node was just claimed; it is no longer idle.
                    debug!(machine_id = %machine_id, "Node claimed during scale-down, skipping");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(marked)
    }
}
