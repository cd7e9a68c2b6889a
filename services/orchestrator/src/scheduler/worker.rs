//! Scheduler background worker.
//!
//! Runs the scheduling pass on a periodic interval.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, instrument};

use super::Scheduler;

/// Scheduler worker that runs the periodic control loop.
pub struct SchedulerWorker {
    scheduler: Scheduler,
    interval: Duration,
}

impl SchedulerWorker {
    pub fn new(scheduler: Scheduler, interval: Duration) -> Self {
        Self {
            scheduler,
            interval,
        }
    }

    /// Run the scheduler worker until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting scheduler worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        // Don't immediately tick on startup - wait for first interval
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.scheduler.tick().await {
                        Ok(stats) => {
                            if stats.changed_anything() {
                                info!(
                                    tasks_assigned = stats.tasks_assigned,
                                    tasks_waiting = stats.tasks_waiting,
                                    assignment_conflicts = stats.assignment_conflicts,
                                    pools_resized = stats.pools_resized,
                                    nodes_marked_for_removal = stats.nodes_marked_for_removal,
                                    "Scheduling pass complete"
                                );
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Scheduling pass failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Scheduler worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
