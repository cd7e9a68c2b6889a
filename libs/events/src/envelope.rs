//! The inbound event envelope - the common wrapper for agent reports.

use fleet_id::MachineId;
use serde::{Deserialize, Serialize};

use crate::error::EventError;
use crate::types::{NodeStateUpdate, WorkerEvent};

/// Either kind of agent report.
///
/// Worker events carry a `running`/`done` key and state updates carry a
/// `state` key, so the untagged representation is unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeEvent {
    WorkerEvent(WorkerEvent),
    StateUpdate(NodeStateUpdate),
}

/// The inbound envelope: which machine is reporting, and what.
///
/// `machine_id` is the only identity attached to the report; everything in
/// it is validated against live entity state before being applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEventEnvelope {
    pub machine_id: MachineId,
    pub event: NodeEvent,
}

impl NodeEventEnvelope {
    /// Decodes an envelope from raw JSON.
    ///
    /// This is the `INVALID_REQUEST` boundary: a payload that does not
    /// decode never reaches the reconciler.
    pub fn from_json(value: serde_json::Value) -> Result<Self, EventError> {
        serde_json::from_value(value).map_err(EventError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_lifecycle::NodeState;

    #[test]
    fn test_envelope_with_worker_event() {
        let json = serde_json::json!({
            "machine_id": "1f0e9a2c-9a4b-4a5e-8f9f-2d3c4b5a6978",
            "event": {"running": {"task_id": "9d2c96ae-3b54-4a11-9d9f-36a3e939bc26"}}
        });
        let envelope = NodeEventEnvelope::from_json(json).unwrap();
        assert!(matches!(envelope.event, NodeEvent::WorkerEvent(_)));
    }

    #[test]
    fn test_envelope_with_state_update() {
        let json = serde_json::json!({
            "machine_id": "1f0e9a2c-9a4b-4a5e-8f9f-2d3c4b5a6978",
            "event": {"state": "free"}
        });
        let envelope = NodeEventEnvelope::from_json(json).unwrap();
        let NodeEvent::StateUpdate(update) = envelope.event else {
            panic!("expected state update");
        };
        assert_eq!(update.state, NodeState::Free);
    }

    #[test]
    fn test_envelope_missing_machine_id_rejected() {
        let json = serde_json::json!({
            "event": {"state": "ready"}
        });
        assert!(NodeEventEnvelope::from_json(json).is_err());
    }

    #[test]
    fn test_envelope_with_unknown_event_shape_rejected() {
        let json = serde_json::json!({
            "machine_id": "1f0e9a2c-9a4b-4a5e-8f9f-2d3c4b5a6978",
            "event": {"heartbeat": {}}
        });
        assert!(NodeEventEnvelope::from_json(json).is_err());
    }

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = NodeEventEnvelope {
            machine_id: fleet_id::MachineId::new(),
            event: NodeEvent::StateUpdate(NodeStateUpdate {
                state: NodeState::Busy,
            }),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        let parsed = NodeEventEnvelope::from_json(json).unwrap();
        assert_eq!(envelope, parsed);
    }
}
