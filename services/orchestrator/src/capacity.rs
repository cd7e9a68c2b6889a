//! Capacity abstraction.
//!
//! The scheduler decides how many node slots each pool should have; the
//! [`CapacityBackend`] performs the actual cloud work (image selection,
//! network setup, machine lifecycle) and lives outside this crate. The
//! sizing arithmetic is pure and tested here.

use async_trait::async_trait;
use fleet_id::{MachineId, ScalesetId};
use thiserror::Error;
use tracing::info;

/// Capacity backend errors.
#[derive(Debug, Error)]
pub enum CapacityError {
    #[error("capacity backend error: {0}")]
    Backend(String),
}

/// The external collaborator that provisions and reclaims machines.
#[async_trait]
pub trait CapacityBackend: Send + Sync {
    /// Set a scaleset's target node count; the backend converges to it.
    async fn set_capacity(&self, scaleset_id: ScalesetId, size: u64) -> Result<(), CapacityError>;

    /// Wipe and reprovision one machine.
    async fn reimage_node(
        &self,
        scaleset_id: ScalesetId,
        machine_id: MachineId,
    ) -> Result<(), CapacityError>;

    /// Remove one machine from its scaleset.
    async fn remove_node(
        &self,
        scaleset_id: ScalesetId,
        machine_id: MachineId,
    ) -> Result<(), CapacityError>;
}

/// Backend that only logs. Used in tests and when running without a cloud
/// provider attached.
#[derive(Debug, Default, Clone)]
pub struct NoopBackend;

#[async_trait]
impl CapacityBackend for NoopBackend {
    async fn set_capacity(&self, scaleset_id: ScalesetId, size: u64) -> Result<(), CapacityError> {
        info!(scaleset_id = %scaleset_id, size, "Set scaleset capacity (noop)");
        Ok(())
    }

    async fn reimage_node(
        &self,
        scaleset_id: ScalesetId,
        machine_id: MachineId,
    ) -> Result<(), CapacityError> {
        info!(scaleset_id = %scaleset_id, machine_id = %machine_id, "Reimage node (noop)");
        Ok(())
    }

    async fn remove_node(
        &self,
        scaleset_id: ScalesetId,
        machine_id: MachineId,
    ) -> Result<(), CapacityError> {
        info!(scaleset_id = %scaleset_id, machine_id = %machine_id, "Remove node (noop)");
        Ok(())
    }
}

/// A pool's demand and supply as observed in one scheduler pass.
///
/// Growth reasons over scaleset *targets*, not live node records, so a
/// pool whose machines are still provisioning is not grown again on the
/// next tick. Shrink is bounded by the idle population: only ready nodes
/// may ever be dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolUtilization {
    /// Tasks targeting the pool in `Scheduled`, `SettingUp`, or `Running`.
    pub outstanding_tasks: usize,
    /// Sum of target sizes across the pool's live scalesets.
    pub target_capacity: u64,
    /// Nodes already flagged for teardown but not yet reclaimed.
    pub pending_teardown: usize,
    /// Idle, schedulable nodes (ready, not flagged).
    pub ready_nodes: usize,
}

impl PoolUtilization {
    /// Capacity that will remain once pending teardowns are reclaimed.
    pub fn effective_capacity(&self) -> i64 {
        self.target_capacity as i64 - self.pending_teardown as i64
    }

    /// How many nodes to add (positive) or drop (negative). One task needs
    /// one node, so the pool converges to `outstanding_tasks` slots.
    pub fn node_delta(&self) -> i64 {
        let wanted = self.outstanding_tasks as i64;
        let effective = self.effective_capacity();
        if wanted >= effective {
            wanted - effective
        } else {
            let excess = effective - wanted;
            -excess.min(self.ready_nodes as i64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    // Empty pool, three tasks waiting: grow by three.
    #[case(3, 0, 0, 0, 3)]
    // Fully sized: no change.
    #[case(4, 4, 0, 0, 0)]
    // Two spare ready nodes: shrink by two.
    #[case(2, 4, 0, 2, -2)]
    // Excess capacity but every node busy: nothing may be dropped.
    #[case(1, 3, 0, 0, 0)]
    // Excess of three but only one node is ready: shrink by one.
    #[case(1, 4, 0, 1, -1)]
    // Idle pool with only ready nodes: drop them all.
    #[case(0, 2, 0, 2, -2)]
    // Growth already in flight (targets raised, machines still booting):
    // no further growth.
    #[case(5, 5, 0, 0, 0)]
    // Teardown already pending covers the excess: no further shrink.
    #[case(1, 3, 2, 1, 0)]
    fn test_node_delta(
        #[case] outstanding: usize,
        #[case] target: u64,
        #[case] pending: usize,
        #[case] ready: usize,
        #[case] expected: i64,
    ) {
        let utilization = PoolUtilization {
            outstanding_tasks: outstanding,
            target_capacity: target,
            pending_teardown: pending,
            ready_nodes: ready,
        };
        assert_eq!(utilization.node_delta(), expected);
    }
}
