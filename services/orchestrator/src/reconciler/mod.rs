//! Event reconciliation.
//!
//! Consumes agent-reported events, validates them against live entity
//! state, and applies the lifecycle transitions. Agent data is untrusted
//! input identified only by `machine_id`; nothing it claims is taken at
//! face value.
//!
//! Concurrency: every read-modify-write here is version-conditioned. On
//! conflict the whole operation is retried from the initial lookup, up to
//! [`MAX_APPLY_ATTEMPTS`]; past that the failure is reported as transient
//! and queue redelivery tries again later. Reprocessing an already-applied
//! event is a no-op because the task machine is forward-only.

mod worker;

pub use worker::EventWorker;

use std::sync::Arc;

use chrono::Utc;
use fleet_events::{
    event_types, NodeEvent, NodeStateUpdate, WorkerEvent,
};
use fleet_id::{MachineId, TaskId};
use fleet_lifecycle::{
    node, task, ErrorCode, NodeDecision, NodeState, NodeTaskState, TaskError, TaskSignal,
    TaskState,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::model::{Node, NodeTask, Task, TaskEventRecord};
use crate::queue::{enqueue_message, node_command_queue, QueueError, WorkQueue};
use crate::store::{
    EntityStore, NodeTaskSelector, StoreError, Versioned, WriteBatch,
};

/// Bound on whole-operation retries when conditional writes conflict.
pub const MAX_APPLY_ATTEMPTS: u32 = 3;

/// Reported stderr/stdout is capped before being recorded on the task.
const MAX_REPORTED_OUTPUT: usize = 4096;

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A worker event referenced a task that does not exist. A live agent
    /// reporting against an unknown task is a real inconsistency, so this
    /// is caller-visible (unlike unknown machines, which are no-ops).
    #[error("unable to find task {task_id}")]
    UnableToFind { task_id: TaskId },

    /// Conditional writes kept conflicting past the retry budget.
    /// Transient: redelivery retries the event.
    #[error("update conflict persisted after {attempts} attempts")]
    UpdateConflict { attempts: u32 },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

impl ReconcileError {
    /// The stable code the API layer reports for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            ReconcileError::UnableToFind { .. } => ErrorCode::UnableToFind,
            ReconcileError::UpdateConflict { .. }
            | ReconcileError::Store(_)
            | ReconcileError::Queue(_) => ErrorCode::UnableToUpdate,
        }
    }

    /// Whether redelivering the event could succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ReconcileError::UnableToFind { .. })
    }
}

/// Applies agent-reported events to the entity store.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn EntityStore>,
    queue: Arc<dyn WorkQueue>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn EntityStore>, queue: Arc<dyn WorkQueue>) -> Self {
        Self { store, queue }
    }

    /// Validates and applies one agent report.
    ///
    /// Succeeds as a no-op for unknown machines: an agent may report after
    /// its node record has already been cleaned up.
    #[instrument(skip(self, event), fields(machine_id = %machine_id))]
    pub async fn apply_node_event(
        &self,
        machine_id: MachineId,
        event: &NodeEvent,
    ) -> Result<(), ReconcileError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.try_apply(machine_id, event).await {
                Err(ReconcileError::Store(e)) if e.is_conflict() => {
                    if attempts >= MAX_APPLY_ATTEMPTS {
                        return Err(ReconcileError::UpdateConflict { attempts });
                    }
                    debug!(attempt = attempts, "Conditional write conflicted, retrying");
                }
                other => return other,
            }
        }
    }

    async fn try_apply(
        &self,
        machine_id: MachineId,
        event: &NodeEvent,
    ) -> Result<(), ReconcileError> {
        let Some(node) = self.store.get_node(machine_id).await? else {
            debug!("Event for unknown machine, ignoring");
            return Ok(());
        };

        match event {
            NodeEvent::WorkerEvent(worker_event) => {
                self.apply_worker_event(node, worker_event).await
            }
            NodeEvent::StateUpdate(update) => self.apply_state_update(node, update).await,
        }
    }

    async fn apply_worker_event(
        &self,
        node: Versioned<Node>,
        event: &WorkerEvent,
    ) -> Result<(), ReconcileError> {
        let task_id = event.task_id();
        let Some(task) = self.store.get_task(task_id).await? else {
            return Err(ReconcileError::UnableToFind { task_id });
        };

        // Audit first: every received worker event is recorded, including
        // duplicates, as part of the same atomic batch as its effects.
        let audit = TaskEventRecord {
            task_id,
            machine_id: node.value.machine_id,
            event: event.clone(),
            recorded_at: Utc::now(),
        };

        let signal = match event {
            WorkerEvent::Running(_) => TaskSignal::WorkerRunning,
            WorkerEvent::Done(done) => TaskSignal::WorkerDone {
                success: done.exit_status.success,
            },
        };

        let transition = match task::apply(task.value.state, signal) {
            Ok(transition) => transition,
            Err(rejection) => {
                if rejection.is_superseded() {
                    debug!(task_id = %task_id, %rejection, "Duplicate or stale worker event");
                } else {
                    warn!(task_id = %task_id, %rejection, "Discarding impossible worker event");
                }
                let mut batch = WriteBatch::new().append_task_event(audit);
                if matches!(event, WorkerEvent::Done(_)) {
                    // Even when the task already moved on (stopped by the
                    // user, duplicate delivery), a done report still means
                    // the task has left this node.
                    batch = batch.delete_node_tasks(NodeTaskSelector::ByTask(task_id));
                }
                self.store.commit(batch).await?;
                return Ok(());
            }
        };

        let mut updated_task = task.value.clone();
        updated_task.state = transition.state;
        if updated_task.error.is_none() {
            if let Some(mut error) = transition.error {
                if let WorkerEvent::Done(done) = event {
                    if !done.stderr.is_empty() {
                        error.push_detail(truncate(&done.stderr, MAX_REPORTED_OUTPUT));
                    }
                }
                updated_task.error = Some(error);
            }
        }
        let failed = updated_task.error.is_some();

        let mut batch = WriteBatch::new()
            .append_task_event(audit)
            .update_task(task.with_value(updated_task.clone()));

        match event {
            WorkerEvent::Running(_) => {
                batch = batch.upsert_node_task(NodeTask {
                    machine_id: node.value.machine_id,
                    task_id,
                    state: NodeTaskState::Running,
                });
                if node.value.state != NodeState::Busy {
                    let mut busy = node.value.clone();
                    busy.state = NodeState::Busy;
                    busy.heartbeat = Some(Utc::now());
                    batch = batch.update_node(node.with_value(busy));
                }
            }
            WorkerEvent::Done(_) => {
                // The task has left the node; the node itself returns to
                // ready through its own state report.
                batch = batch.delete_node_tasks(NodeTaskSelector::ByTask(task_id));
            }
        }

        self.store.commit(batch).await?;

        if transition.state == TaskState::Stopping {
            if failed {
                info!(
                    event_type = event_types::TASK_FAILED,
                    task_id = %task_id,
                    job_id = %updated_task.job_id,
                    "Task ended abnormally"
                );
                self.fail_dependents(&updated_task).await?;
            } else {
                info!(
                    event_type = event_types::TASK_STOPPED,
                    task_id = %task_id,
                    job_id = %updated_task.job_id,
                    "Task finished"
                );
            }
        }

        Ok(())
    }

    /// Propagates a task failure to the tasks in the same job that listed
    /// it as a prerequisite.
    ///
    /// Retries per dependent: the main transition has already committed,
    /// so the outer retry loop would see it as superseded and never come
    /// back here.
    async fn fail_dependents(&self, failed: &Task) -> Result<(), ReconcileError> {
        let siblings = self.store.list_tasks_by_job(failed.job_id).await?;
        for sibling in siblings {
            if !sibling.value.config.prereq_tasks.contains(&failed.task_id) {
                continue;
            }

            let dependent_id = sibling.value.task_id;
            let mut current = sibling;
            for _ in 0..MAX_APPLY_ATTEMPTS {
                let Ok(transition) = task::apply(current.value.state, TaskSignal::StopRequested)
                else {
                    break; // already shutting down
                };

                let mut updated = current.value.clone();
                updated.state = transition.state;
                if updated.error.is_none() {
                    updated.error = Some(TaskError::new(
                        ErrorCode::TaskFailed,
                        format!("prerequisite task {} failed", failed.task_id),
                    ));
                }

                match self
                    .store
                    .commit(WriteBatch::new().update_task(current.with_value(updated)))
                    .await
                {
                    Ok(()) => {
                        // If the dependent already occupies a node, tell
                        // that node to stop; its agent reports completion
                        // through the normal path.
                        for node_task in
                            self.store.list_node_tasks_by_task(dependent_id).await?
                        {
                            enqueue_message(
                                self.queue.as_ref(),
                                &node_command_queue(node_task.machine_id),
                                &fleet_events::NodeCommand::stop_node(),
                            )
                            .await?;
                        }
                        info!(
                            event_type = event_types::TASK_FAILED,
                            task_id = %dependent_id,
                            prereq = %failed.task_id,
                            "Failed dependent task"
                        );
                        break;
                    }
                    Err(e) if e.is_conflict() => {
                        match self.store.get_task(dependent_id).await? {
                            Some(fresh) => current = fresh,
                            None => break,
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    async fn apply_state_update(
        &self,
        node: Versioned<Node>,
        update: &NodeStateUpdate,
    ) -> Result<(), ReconcileError> {
        let machine_id = node.value.machine_id;
        match node::plan(node.value.state, update.state, node.value.flags()) {
            NodeDecision::Ignore => {
                debug!(
                    current = %node.value.state,
                    reported = %update.state,
                    "Stale or impossible node state report, ignoring"
                );
                Ok(())
            }
            NodeDecision::HoldForTeardown => {
                // Recorded state stays put until the agent confirms
                // shutdown through its own reports.
                info!(
                    current = %node.value.state,
                    reported = %update.state,
                    "Node is idle with teardown requested, sending stop command"
                );
                enqueue_message(
                    self.queue.as_ref(),
                    &node_command_queue(machine_id),
                    &fleet_events::NodeCommand::stop_node(),
                )
                .await?;
                Ok(())
            }
            NodeDecision::Advance(next) => {
                let mut updated = node.value.clone();
                updated.state = next;
                updated.heartbeat = Some(Utc::now());
                self.store
                    .commit(WriteBatch::new().update_node(node.with_value(updated)))
                    .await?;
                info!(
                    event_type = event_types::NODE_STATE_CHANGED,
                    state = %next,
                    "Node state advanced"
                );
                Ok(())
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let s = "héllo".repeat(1000);
        let out = truncate(&s, 10);
        assert!(out.len() <= 10);
        assert!(s.starts_with(&out));
    }

    #[test]
    fn test_error_codes() {
        let err = ReconcileError::UnableToFind {
            task_id: TaskId::new(),
        };
        assert_eq!(err.code(), ErrorCode::UnableToFind);
        assert!(!err.is_transient());

        let err = ReconcileError::UpdateConflict { attempts: 3 };
        assert_eq!(err.code(), ErrorCode::UnableToUpdate);
        assert!(err.is_transient());
    }
}
