//! Pure lifecycle state machines.
//!
//! This library holds the transition logic for every entity the
//! orchestrator tracks: tasks, nodes, node-task assignments, scalesets,
//! and jobs. Each machine is a pure function over an immutable snapshot —
//! `(current state, signal) -> Result<transition, rejection>` — with no
//! store or queue dependency, so the tricky reconciliation rules are unit
//! testable in isolation.
//!
//! # Invariants
//!
//! - Task and job states only move forward in their declared order
//! - Re-applying an already-applied signal is a rejection the caller
//!   treats as a no-op, never a state change
//! - Decisions are deterministic given the same inputs

mod error;
pub mod job;
pub mod node;
pub mod node_task;
pub mod scaleset;
pub mod task;

pub use error::{ErrorCode, TaskError};
pub use job::JobState;
pub use node::{NodeDecision, NodeFlags, NodeState};
pub use node_task::NodeTaskState;
pub use scaleset::ScalesetState;
pub use task::{Rejection, TaskSignal, TaskState, TaskTransition};
