//! Periodic housekeeping.
//!
//! The janitor closes out everything the event-driven paths leave behind:
//! jobs whose runtime budget elapsed, stopping tasks whose node
//! associations are gone, nodes whose agents went quiet, and flagged nodes
//! whose agents have confirmed shutdown.

use std::time::Duration;

use chrono::Utc;
use fleet_events::{event_types, NodeCommand};
use fleet_lifecycle::{task, JobState, NodeState, TaskSignal, TaskState};
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::error::ApiError;
use crate::ops;
use crate::queue::{enqueue_message, node_command_queue};
use crate::state::AppState;

#[derive(Debug, Clone)]
pub struct JanitorConfig {
    pub interval: Duration,
    /// A node whose agent has not reported for this long is orphaned.
    pub node_heartbeat_timeout: Duration,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            node_heartbeat_timeout: Duration::from_secs(600),
        }
    }
}

pub struct Janitor {
    state: AppState,
    config: JanitorConfig,
}

impl Janitor {
    pub fn new(state: AppState, config: JanitorConfig) -> Self {
        Self { state, config }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            node_heartbeat_timeout_secs = self.config.node_heartbeat_timeout.as_secs(),
            "Starting janitor"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Janitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run one housekeeping pass. Each category logs and continues on
    /// failure; a bad entity never stalls the rest of the sweep.
    pub async fn sweep(&self) {
        match self.expire_jobs().await {
            Ok(count) if count > 0 => info!(expired = count, "Stopped jobs past their budget"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to expire jobs"),
        }

        match self.finalize_tasks().await {
            Ok(count) if count > 0 => info!(finalized = count, "Finalized stopping tasks"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to finalize tasks"),
        }

        match self.close_jobs().await {
            Ok(count) if count > 0 => info!(closed = count, "Closed finished jobs"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to close jobs"),
        }

        match self.sweep_nodes().await {
            Ok(count) if count > 0 => info!(affected = count, "Swept nodes"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to sweep nodes"),
        }
    }

    /// Stop jobs whose runtime budget has elapsed.
    async fn expire_jobs(&self) -> Result<u64, ApiError> {
        let store = self.state.store();
        let now = Utc::now();
        let mut expired = 0u64;

        let jobs = store
            .list_jobs_by_state(&[JobState::Init, JobState::Enabled])
            .await?;
        for job in jobs {
            if job.value.budget_deadline() > now {
                continue;
            }
            let job_id = job.value.job_id;
            let mut stopping = job.value.clone();
            stopping.state = JobState::Stopping;
            match store.update_job(job.with_value(stopping)).await {
                Ok(_) => {}
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }

            ops::tasks::stop_tasks_for_job(&self.state, job_id).await?;
            info!(job_id = %job_id, "Job runtime budget elapsed, stopping");
            expired += 1;
        }
        Ok(expired)
    }

    /// Move `Stopping` tasks whose node associations are gone to `Stopped`.
    async fn finalize_tasks(&self) -> Result<u64, ApiError> {
        let store = self.state.store();
        let mut finalized = 0u64;

        let tasks = store.list_tasks_by_state(&[TaskState::Stopping]).await?;
        for task_record in tasks {
            let task_id = task_record.value.task_id;
            if !store.list_node_tasks_by_task(task_id).await?.is_empty() {
                // Still occupying a node; its agent has not reported done.
                continue;
            }

            let Ok(transition) = task::apply(task_record.value.state, TaskSignal::CleanupComplete)
            else {
                continue;
            };

            let failed = task_record.value.error.is_some();
            let job_id = task_record.value.job_id;
            let mut updated = task_record.value.clone();
            updated.state = transition.state;
            updated.end_time = Some(Utc::now());

            match store.update_task(task_record.with_value(updated)).await {
                Ok(_) => {
                    info!(
                        event_type = if failed {
                            event_types::TASK_FAILED
                        } else {
                            event_types::TASK_STOPPED
                        },
                        task_id = %task_id,
                        job_id = %job_id,
                        "Task stopped"
                    );
                    finalized += 1;
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(finalized)
    }

    /// Advance jobs whose tasks have all stopped.
    async fn close_jobs(&self) -> Result<u64, ApiError> {
        let store = self.state.store();
        let mut closed = 0u64;

        let jobs = store
            .list_jobs_by_state(&[JobState::Enabled, JobState::Stopping])
            .await?;
        for job in jobs {
            let tasks = store.list_tasks_by_job(job.value.job_id).await?;
            if tasks.is_empty() || !tasks.iter().all(|t| t.value.state.is_stopped()) {
                continue;
            }

            let job_id = job.value.job_id;
            let next = match job.value.state {
                JobState::Enabled => JobState::Stopping,
                JobState::Stopping => JobState::Stopped,
                _ => continue,
            };
            let mut updated = job.value.clone();
            updated.state = next;
            if next == JobState::Stopped {
                updated.end_time = Some(Utc::now());
            }

            match store.update_job(job.with_value(updated)).await {
                Ok(_) => {
                    if next == JobState::Stopped {
                        info!(
                            event_type = event_types::JOB_STOPPED,
                            job_id = %job_id,
                            "Job stopped"
                        );
                        closed += 1;
                    }
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(closed)
    }

    /// Orphan detection and teardown of confirmed-done nodes.
    async fn sweep_nodes(&self) -> Result<u64, ApiError> {
        let store = self.state.store();
        let capacity = self.state.capacity();
        let now = Utc::now();
        let mut affected = 0u64;

        let nodes = store
            .list_nodes_by_state(
                None,
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

        for node in nodes {
            let machine_id = node.value.machine_id;

            // Agents confirm shutdown by reporting Done; only then do the
            // deferred teardown flags actually execute.
            if node.value.state == NodeState::Done {
                let Some(scaleset_id) = node.value.scaleset_id else {
                    store.delete_node(machine_id).await?;
                    affected += 1;
                    continue;
                };

                if node.value.delete_requested {
                    self.release_scaleset_slot(scaleset_id).await?;
                    capacity.remove_node(scaleset_id, machine_id).await?;
                    store.delete_node(machine_id).await?;
                    info!(machine_id = %machine_id, "Removed node");
                } else {
                    // Reimage returns the machine to the pool as a blank
                    // slate; the agent re-registers when it comes back.
                    capacity.reimage_node(scaleset_id, machine_id).await?;
                    let mut reset = node.value.clone();
                    reset.state = NodeState::Init;
                    reset.reimage_requested = false;
                    reset.delete_requested = false;
                    reset.heartbeat = None;
                    match store.update_node(node.with_value(reset)).await {
                        Ok(_) => info!(machine_id = %machine_id, "Reimaging node"),
                        Err(e) if e.is_conflict() => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                affected += 1;
                continue;
            }

            // Orphan detection: a quiet agent on a working node.
            let last_seen = node.value.heartbeat.unwrap_or(node.value.registered_at);
            let stale = now - last_seen
                > chrono::Duration::from_std(self.config.node_heartbeat_timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(600));
            if stale && !node.value.reimage_requested {
                warn!(
                    machine_id = %machine_id,
                    state = %node.value.state,
                    "Node heartbeat stale, marking for reimage"
                );
                let was_idle = node.value.state.is_idle();
                let mut flagged = node.value.clone();
                flagged.reimage_requested = true;
                match store.update_node(node.with_value(flagged)).await {
                    Ok(_) => {
                        if was_idle {
                            enqueue_message(
                                self.state.queue().as_ref(),
                                &node_command_queue(machine_id),
                                &NodeCommand::stop_node(),
                            )
                            .await?;
                        }
                        affected += 1;
                    }
                    Err(e) if e.is_conflict() => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(affected)
    }

    /// Lower the scaleset target by one reclaimed node.
    async fn release_scaleset_slot(
        &self,
        scaleset_id: fleet_id::ScalesetId,
    ) -> Result<(), ApiError> {
        let store = self.state.store();
        let Some(scaleset) = store.get_scaleset(scaleset_id).await? else {
            return Ok(());
        };
        let mut updated = scaleset.value.clone();
        updated.size = updated.size.saturating_sub(1);
        let size = updated.size;
        match store.update_scaleset(scaleset.with_value(updated)).await {
            Ok(_) => {
                self.state.capacity().set_capacity(scaleset_id, size).await?;
                Ok(())
            }
            // A concurrent resize wins; the next sweep reconverges.
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
