//! Typed ID definitions for all orchestrator resources.
//!
//! Each ID type is a distinct newtype so a TaskId can never be passed where
//! a MachineId is expected. All are UUID-backed.

use crate::define_id;

// =============================================================================
// Work Model
// =============================================================================

define_id!(JobId);
define_id!(TaskId);

// =============================================================================
// Compute Capacity
// =============================================================================

define_id!(PoolId);
define_id!(ScalesetId);

// The compute instance identity reported by node agents.
define_id!(MachineId);

// =============================================================================
// Requests
// =============================================================================

define_id!(RequestId);

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_roundtrip() {
        let id = TaskId::new();
        let s = id.to_string();
        let parsed: TaskId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_machine_id_plain_uuid_format() {
        let id = MachineId::new();
        let s = id.to_string();
        // Hyphenated UUID: 8-4-4-4-12
        assert_eq!(s.len(), 36);
        assert_eq!(s.matches('-').count(), 4);
    }

    #[test]
    fn test_machine_id_empty() {
        let result: Result<MachineId, _> = "".parse();
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), crate::IdError::Empty));
    }

    #[test]
    fn test_machine_id_nil_rejected() {
        let result: Result<MachineId, _> = "00000000-0000-0000-0000-000000000000".parse();
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), crate::IdError::Nil));
    }

    #[test]
    fn test_machine_id_invalid_uuid() {
        let result: Result<MachineId, _> = "not-a-uuid".parse();
        assert!(result.is_err());
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidUuid(_)
        ));
    }

    #[test]
    fn test_job_id_json_roundtrip() {
        let id = JobId::new();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: JobId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_machine_id_json_is_bare_uuid() {
        let id = MachineId::new();
        let json = serde_json::to_string(&id).unwrap();
        // Serialized as a plain quoted UUID string, no prefix
        assert_eq!(json.len(), 38);
        assert!(json.starts_with('"') && json.ends_with('"'));
    }

    #[test]
    fn test_distinct_ids_are_unique() {
        let a = TaskId::new();
        let b = TaskId::new();
        assert_ne!(a, b);
    }
}
