//! Task operations.

use fleet_events::NodeCommand;
use fleet_id::{JobId, TaskId};
use fleet_lifecycle::{task, JobState, TaskSignal, TaskState};
use tracing::{debug, info};

use crate::error::ApiError;
use crate::model::{Task, TaskConfig};
use crate::queue::{enqueue_message, node_command_queue};
use crate::state::AppState;
use crate::store::Versioned;

pub async fn create_task(
    state: &AppState,
    job_id: JobId,
    config: TaskConfig,
) -> Result<Versioned<Task>, ApiError> {
    let store = state.store();

    let job = store
        .get_job(job_id)
        .await?
        .ok_or_else(|| ApiError::unable_to_find(format!("job {job_id}")))?;
    if !job.value.state.is_active() {
        return Err(ApiError::invalid_request(
            "job is not accepting new tasks",
        ));
    }

    if store.get_pool(&config.pool_name).await?.is_none() {
        return Err(ApiError::unable_to_find(format!(
            "pool {}",
            config.pool_name
        )));
    }

    for prereq_id in &config.prereq_tasks {
        let prereq = store
            .get_task(*prereq_id)
            .await?
            .ok_or_else(|| ApiError::unable_to_find(format!("prerequisite task {prereq_id}")))?;
        if prereq.value.job_id != job_id {
            return Err(ApiError::invalid_request(
                "prerequisite tasks must belong to the same job",
            ));
        }
    }

    // Creation is queueing: the task is immediately visible to the
    // scheduler's Scheduled scan.
    let mut task_record = Task::new(job_id, config);
    task_record.state = TaskState::Scheduled;
    let stored = store.insert_task(task_record).await?;

    // The first task enables the job.
    if job.value.state == JobState::Init {
        let mut enabled = job.value.clone();
        enabled.state = JobState::Enabled;
        match store.update_job(job.with_value(enabled)).await {
            Ok(_) => {}
            // Lost to a concurrent enable or stop; either is fine.
            Err(e) if e.is_conflict() => {}
            Err(e) => return Err(e.into()),
        }
    }

    info!(
        task_id = %stored.value.task_id,
        job_id = %job_id,
        task_type = %stored.value.config.task_type,
        pool = %stored.value.config.pool_name,
        "Created task"
    );
    Ok(stored)
}

pub async fn get_task(state: &AppState, task_id: TaskId) -> Result<Versioned<Task>, ApiError> {
    state
        .store()
        .get_task(task_id)
        .await?
        .ok_or_else(|| ApiError::unable_to_find(format!("task {task_id}")))
}

pub async fn search_tasks(
    state: &AppState,
    states: &[TaskState],
) -> Result<Vec<Versioned<Task>>, ApiError> {
    Ok(state.store().list_tasks_by_state(states).await?)
}

/// Request a task stop. The task enters `Stopping` immediately; any node
/// it occupies is told to stop and reports its own completion.
///
/// Conflicts re-read and retry so the stop intent survives racing writers
/// (a scheduler claim, a worker report).
pub async fn stop_task(state: &AppState, task_id: TaskId) -> Result<(), ApiError> {
    let store = state.store();
    let mut task_record = get_task(state, task_id).await?;

    loop {
        let Ok(transition) = task::apply(task_record.value.state, TaskSignal::StopRequested)
        else {
            debug!(task_id = %task_id, "Task already shutting down");
            return Ok(());
        };

        let mut updated = task_record.value.clone();
        updated.state = transition.state;
        match store.update_task(task_record.with_value(updated)).await {
            Ok(_) => break,
            Err(e) if e.is_conflict() => {
                task_record = get_task(state, task_id).await?;
            }
            Err(e) => return Err(e.into()),
        }
    }

    for node_task in store.list_node_tasks_by_task(task_id).await? {
        enqueue_message(
            state.queue().as_ref(),
            &node_command_queue(node_task.machine_id),
            &NodeCommand::stop_node(),
        )
        .await?;
    }

    info!(task_id = %task_id, "Stopping task");
    Ok(())
}

/// The audit trail of worker events received for a task.
pub async fn task_events(
    state: &AppState,
    task_id: TaskId,
) -> Result<Vec<crate::model::TaskEventRecord>, ApiError> {
    get_task(state, task_id).await?;
    Ok(state.store().list_task_events(task_id).await?)
}

/// Stop every unfinished task in a job.
pub(crate) async fn stop_tasks_for_job(state: &AppState, job_id: JobId) -> Result<(), ApiError> {
    let tasks = state.store().list_tasks_by_job(job_id).await?;
    for task_record in tasks {
        if task_record.value.state.is_shutting_down() {
            continue;
        }
        stop_task(state, task_record.value.task_id).await?;
    }
    Ok(())
}
