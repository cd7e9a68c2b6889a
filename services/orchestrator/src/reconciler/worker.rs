//! Message-driven reconciliation worker.
//!
//! Drains the inbound node-events queue and applies each envelope through
//! the reconciler. Delivery is at-least-once: transient failures requeue
//! the message, malformed or unresolvable ones are dropped with a log —
//! redelivery cannot fix those.

use std::sync::Arc;
use std::time::Duration;

use fleet_events::NodeEventEnvelope;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::queue::{WorkQueue, NODE_EVENTS_QUEUE};

use super::Reconciler;

/// Queue consumer driving the reconciler.
pub struct EventWorker {
    reconciler: Reconciler,
    queue: Arc<dyn WorkQueue>,
    poll_interval: Duration,
}

impl EventWorker {
    pub fn new(reconciler: Reconciler, queue: Arc<dyn WorkQueue>, poll_interval: Duration) -> Self {
        Self {
            reconciler,
            queue,
            poll_interval,
        }
    }

    /// Run the event worker until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Starting event worker"
        );

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.drain_queue().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Event worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Process everything currently waiting on the queue.
    async fn drain_queue(&self) {
        loop {
            let message = match self.queue.dequeue(NODE_EVENTS_QUEUE).await {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Failed to dequeue node event");
                    break;
                }
            };

            let envelope = match NodeEventEnvelope::from_json(message.clone()) {
                Ok(envelope) => envelope,
                Err(e) => {
                    // INVALID_REQUEST boundary: never reaches a state machine.
                    warn!(error = %e, "Dropping malformed node event");
                    continue;
                }
            };

            match self
                .reconciler
                .apply_node_event(envelope.machine_id, &envelope.event)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "Transient failure applying node event, requeueing");
                    if let Err(e) = self.queue.enqueue(NODE_EVENTS_QUEUE, message).await {
                        error!(error = %e, "Failed to requeue node event");
                    }
                    // Give the conflicting writer a beat before reprocessing.
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Dropping unprocessable node event");
                }
            }
        }
    }
}
