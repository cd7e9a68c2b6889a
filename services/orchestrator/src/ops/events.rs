//! Inbound agent event submission.

use fleet_events::NodeEventEnvelope;
use tracing::debug;

use crate::error::ApiError;
use crate::reconciler::Reconciler;
use crate::state::AppState;

/// Decode and apply one agent report.
///
/// This is the `INVALID_REQUEST` boundary: a payload that does not decode
/// is rejected here, before any state machine sees it. A well-formed event
/// for an unknown machine succeeds as a no-op; one referencing an unknown
/// task fails with `UNABLE_TO_FIND`.
pub async fn submit(state: &AppState, payload: serde_json::Value) -> Result<(), ApiError> {
    let envelope = NodeEventEnvelope::from_json(payload).map_err(ApiError::from)?;
    debug!(machine_id = %envelope.machine_id, "Received node event");

    let reconciler = Reconciler::new(state.store().clone(), state.queue().clone());
    reconciler
        .apply_node_event(envelope.machine_id, &envelope.event)
        .await
        .map_err(|e| ApiError::new(e.code(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use fleet_lifecycle::ErrorCode;

    use crate::capacity::NoopBackend;
    use crate::queue::MemoryQueue;
    use crate::store::MemoryStore;

    fn test_state() -> AppState {
        AppState::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryQueue::new()),
            Arc::new(NoopBackend),
        )
    }

    #[tokio::test]
    async fn test_malformed_event_rejected_as_invalid_request() {
        let state = test_state();
        let err = submit(&state, serde_json::json!({"bogus": true}))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_unknown_machine_is_accepted() {
        let state = test_state();
        let payload = serde_json::json!({
            "machine_id": fleet_id::MachineId::new(),
            "event": {"state": "ready"}
        });
        submit(&state, payload).await.unwrap();
    }
}
