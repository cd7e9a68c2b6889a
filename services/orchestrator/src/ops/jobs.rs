//! Job operations.

use fleet_id::JobId;
use fleet_lifecycle::JobState;
use tracing::info;

use crate::error::ApiError;
use crate::model::{Job, JobConfig};
use crate::state::AppState;
use crate::store::Versioned;

use super::tasks;

pub async fn create_job(state: &AppState, config: JobConfig) -> Result<Versioned<Job>, ApiError> {
    if config.duration_hours == 0 {
        return Err(ApiError::invalid_request("job duration must be non-zero"));
    }

    let job = Job::new(config);
    let stored = state.store().insert_job(job).await?;
    info!(
        job_id = %stored.value.job_id,
        project = %stored.value.config.project,
        "Created job"
    );
    Ok(stored)
}

pub async fn get_job(state: &AppState, job_id: JobId) -> Result<Versioned<Job>, ApiError> {
    state
        .store()
        .get_job(job_id)
        .await?
        .ok_or_else(|| ApiError::unable_to_find(format!("job {job_id}")))
}

pub async fn search_jobs(
    state: &AppState,
    states: &[JobState],
) -> Result<Vec<Versioned<Job>>, ApiError> {
    Ok(state.store().list_jobs_by_state(states).await?)
}

/// Request a job stop. Cancellation is a state transition: each of the
/// job's unfinished tasks is asked to stop, and the janitor closes the job
/// once they all have.
pub async fn stop_job(state: &AppState, job_id: JobId) -> Result<(), ApiError> {
    let job = get_job(state, job_id).await?;
    if !job.value.state.can_transition_to(JobState::Stopping) {
        return Ok(()); // already stopping or stopped
    }

    let mut stopping = job.value.clone();
    stopping.state = JobState::Stopping;
    match state.store().update_job(job.with_value(stopping)).await {
        Ok(_) => {}
        // A concurrent stop is fine; keep going so the tasks get stopped.
        Err(e) if e.is_conflict() => {}
        Err(e) => return Err(e.into()),
    }

    tasks::stop_tasks_for_job(state, job_id).await?;
    info!(job_id = %job_id, "Stopping job");
    Ok(())
}
