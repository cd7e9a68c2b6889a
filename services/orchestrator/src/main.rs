//! fuzzfleet orchestrator
//!
//! The orchestrator is the coordination service for the fuzzing platform:
//! it assigns tasks to nodes, reconciles agent-reported state, and drives
//! compute-capacity sizing.

use std::sync::Arc;

use anyhow::Result;
use fleet_orchestrator::{
    capacity::NoopBackend,
    config,
    janitor::{Janitor, JanitorConfig},
    queue::MemoryQueue,
    reconciler::{EventWorker, Reconciler},
    scheduler::{Scheduler, SchedulerWorker},
    state::AppState,
    store::{EntityStore, PgStore},
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to FLEET_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fuzzfleet orchestrator");

    // Connect to the entity store
    let store = match PgStore::connect(&config.database).await {
        Ok(store) => {
            info!("Entity store connection established");
            store
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to entity store");
            return Err(e.into());
        }
    };

    // Run migrations in dev mode
    if config.dev_mode {
        info!("Running entity store migrations (dev mode)");
        if let Err(e) = store.run_migrations().await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
    }

    let store: Arc<dyn EntityStore> = Arc::new(store);
    // In-process queue binding; a broker-backed implementation of the same
    // contract slots in here when agents run off-box.
    let queue = Arc::new(MemoryQueue::new());
    let capacity = Arc::new(NoopBackend);

    let state = AppState::new(store.clone(), queue.clone(), capacity.clone());

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start event worker in background
    let event_worker = EventWorker::new(
        Reconciler::new(store.clone(), queue.clone()),
        queue.clone(),
        config.event_poll_interval,
    );
    let event_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            event_worker.run(shutdown_rx).await;
        }
    });

    // Start scheduler worker in background
    let scheduler_worker = SchedulerWorker::new(
        Scheduler::new(store.clone(), queue.clone(), capacity.clone()),
        config.scheduler_interval,
    );
    let scheduler_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            scheduler_worker.run(shutdown_rx).await;
        }
    });

    // Start janitor in background
    let janitor = Janitor::new(
        state.clone(),
        JanitorConfig {
            interval: config.janitor_interval,
            node_heartbeat_timeout: config.node_heartbeat_timeout,
        },
    );
    let janitor_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            janitor.run(shutdown_rx).await;
        }
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    // Wait for workers to finish
    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, event_handle).await {
        warn!(error = %e, "Event worker did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, scheduler_handle).await {
        warn!(error = %e, "Scheduler worker did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, janitor_handle).await {
        warn!(error = %e, "Janitor did not shut down in time");
    }

    info!("Orchestrator shutdown complete");
    Ok(())
}
