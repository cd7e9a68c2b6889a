//! Task lifecycle state machine.
//!
//! Tasks move forward through
//! `Init → Scheduled → SettingUp → Running → Stopping → Stopped` and never
//! backward. Agent reports arrive at-least-once and unordered, so every
//! signal that implies a backward move is rejected as [`Rejection::Superseded`]
//! — the caller logs it and treats the operation as a no-op. That rejection,
//! not a dedup table, is what makes duplicate delivery idempotent.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{ErrorCode, TaskError};

/// Task lifecycle states, in transition order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created, not yet considered by the scheduler.
    #[default]
    Init,
    /// Waiting for a node with free capacity.
    Scheduled,
    /// Assigned to a node; the agent is preparing the work.
    SettingUp,
    /// The worker process is executing.
    Running,
    /// Terminal-bound; resources are being released.
    Stopping,
    /// Fully stopped. Frozen: no further transitions.
    Stopped,
}

impl TaskState {
    /// Returns true once the task can never run again.
    pub fn is_shutting_down(&self) -> bool {
        matches!(self, TaskState::Stopping | TaskState::Stopped)
    }

    /// Returns true if the worker process has (at some point) been running.
    pub fn has_started(&self) -> bool {
        *self >= TaskState::Running
    }

    /// Returns true for the final, frozen state.
    pub fn is_stopped(&self) -> bool {
        matches!(self, TaskState::Stopped)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Init => "init",
            TaskState::Scheduled => "scheduled",
            TaskState::SettingUp => "setting_up",
            TaskState::Running => "running",
            TaskState::Stopping => "stopping",
            TaskState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// The inputs that drive the task machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSignal {
    /// The scheduler assigned the task to a node.
    Assigned,
    /// The agent reported the worker process running.
    WorkerRunning,
    /// The agent reported the worker process finished.
    WorkerDone { success: bool },
    /// An external stop request (user or job-level stop).
    StopRequested,
    /// Resource cleanup for a stopping task finished.
    CleanupComplete,
}

impl TaskSignal {
    fn name(&self) -> &'static str {
        match self {
            TaskSignal::Assigned => "assigned",
            TaskSignal::WorkerRunning => "worker_running",
            TaskSignal::WorkerDone { .. } => "worker_done",
            TaskSignal::StopRequested => "stop_requested",
            TaskSignal::CleanupComplete => "cleanup_complete",
        }
    }
}

/// The outcome of applying a signal: the new state, plus the terminal error
/// to record if the signal implies an abnormal end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskTransition {
    pub state: TaskState,
    pub error: Option<TaskError>,
}

impl TaskTransition {
    fn to(state: TaskState) -> Self {
        Self { state, error: None }
    }
}

/// Why a signal was not applied.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The signal implies a state at or behind the current one. Expected
    /// under at-least-once, unordered delivery; callers treat it as success.
    #[error("superseded: task is already at or past {current}")]
    Superseded { current: TaskState },

    /// The signal makes no sense for the current state. Logged and
    /// discarded, never applied.
    #[error("invalid signal {signal} for task in state {current}")]
    Invalid {
        current: TaskState,
        signal: &'static str,
    },
}

impl Rejection {
    /// True for the benign duplicate/out-of-order case.
    pub fn is_superseded(&self) -> bool {
        matches!(self, Rejection::Superseded { .. })
    }
}

/// Applies one signal to the task machine.
///
/// Guarantees the returned state is never earlier than `current` in the
/// lifecycle order.
pub fn apply(current: TaskState, signal: TaskSignal) -> Result<TaskTransition, Rejection> {
    match signal {
        TaskSignal::Assigned => {
            if current >= TaskState::SettingUp {
                return Err(Rejection::Superseded { current });
            }
            Ok(TaskTransition::to(TaskState::SettingUp))
        }

        TaskSignal::WorkerRunning => {
            if current >= TaskState::Running {
                return Err(Rejection::Superseded { current });
            }
            Ok(TaskTransition::to(TaskState::Running))
        }

        TaskSignal::WorkerDone { success } => {
            if current.is_shutting_down() {
                return Err(Rejection::Superseded { current });
            }
            // A task that dies before starting is always an error, whatever
            // exit status the agent reported.
            let error = if !success {
                Some(TaskError::new(
                    ErrorCode::TaskFailed,
                    "task reported unsuccessful exit",
                ))
            } else if !current.has_started() {
                Some(TaskError::new(
                    ErrorCode::TaskFailed,
                    "task exited before reaching running",
                ))
            } else {
                None
            };
            Ok(TaskTransition {
                state: TaskState::Stopping,
                error,
            })
        }

        TaskSignal::StopRequested => {
            if current.is_shutting_down() {
                return Err(Rejection::Superseded { current });
            }
            Ok(TaskTransition::to(TaskState::Stopping))
        }

        TaskSignal::CleanupComplete => match current {
            TaskState::Stopping => Ok(TaskTransition::to(TaskState::Stopped)),
            TaskState::Stopped => Err(Rejection::Superseded { current }),
            _ => Err(Rejection::Invalid {
                current,
                signal: signal.name(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    const ALL_STATES: [TaskState; 6] = [
        TaskState::Init,
        TaskState::Scheduled,
        TaskState::SettingUp,
        TaskState::Running,
        TaskState::Stopping,
        TaskState::Stopped,
    ];

    fn arb_state() -> impl Strategy<Value = TaskState> {
        prop::sample::select(ALL_STATES.to_vec())
    }

    fn arb_signal() -> impl Strategy<Value = TaskSignal> {
        prop_oneof![
            Just(TaskSignal::Assigned),
            Just(TaskSignal::WorkerRunning),
            any::<bool>().prop_map(|success| TaskSignal::WorkerDone { success }),
            Just(TaskSignal::StopRequested),
            Just(TaskSignal::CleanupComplete),
        ]
    }

    proptest! {
        // The key forward-only property: no signal ever yields a state
        // earlier than the one it was applied to.
        #[test]
        fn state_never_moves_backward(current in arb_state(), signal in arb_signal()) {
            if let Ok(t) = apply(current, signal) {
                prop_assert!(t.state >= current);
            }
        }

        // Applying the same signal twice: the second application is either
        // rejected or lands on the same state (idempotent under
        // at-least-once delivery).
        #[test]
        fn reapplication_is_idempotent(current in arb_state(), signal in arb_signal()) {
            if let Ok(first) = apply(current, signal) {
                match apply(first.state, signal) {
                    Ok(second) => prop_assert_eq!(second.state, first.state),
                    Err(r) => prop_assert!(r.is_superseded() || matches!(r, Rejection::Invalid { .. }), "unexpected rejection on reapplication"),
                }
            }
        }
    }

    #[rstest]
    #[case(TaskState::Init, TaskState::SettingUp)]
    #[case(TaskState::Scheduled, TaskState::SettingUp)]
    fn test_assignment_enters_setting_up(#[case] from: TaskState, #[case] expected: TaskState) {
        let t = apply(from, TaskSignal::Assigned).unwrap();
        assert_eq!(t.state, expected);
        assert!(t.error.is_none());
    }

    #[test]
    fn test_assignment_after_running_is_superseded() {
        let r = apply(TaskState::Running, TaskSignal::Assigned).unwrap_err();
        assert!(r.is_superseded());
    }

    #[test]
    fn test_worker_running_from_setting_up() {
        let t = apply(TaskState::SettingUp, TaskSignal::WorkerRunning).unwrap();
        assert_eq!(t.state, TaskState::Running);
        assert!(t.error.is_none());
    }

    #[test]
    fn test_successful_done_after_running_has_no_error() {
        let t = apply(TaskState::Running, TaskSignal::WorkerDone { success: true }).unwrap();
        assert_eq!(t.state, TaskState::Stopping);
        assert!(t.error.is_none());
    }

    #[test]
    fn test_unsuccessful_done_records_task_failed() {
        let t = apply(TaskState::Running, TaskSignal::WorkerDone { success: false }).unwrap();
        assert_eq!(t.state, TaskState::Stopping);
        assert_eq!(t.error.unwrap().code, ErrorCode::TaskFailed);
    }

    #[rstest]
    #[case(true)]
    #[case(false)]
    fn test_done_before_running_is_always_an_error(#[case] success: bool) {
        // A task that never reached running died during setup or dispatch;
        // the reported exit status does not matter.
        let t = apply(TaskState::Scheduled, TaskSignal::WorkerDone { success }).unwrap();
        assert_eq!(t.state, TaskState::Stopping);
        assert_eq!(t.error.unwrap().code, ErrorCode::TaskFailed);
    }

    #[test]
    fn test_duplicate_done_is_no_op() {
        let first = apply(TaskState::Running, TaskSignal::WorkerDone { success: true }).unwrap();
        assert_eq!(first.state, TaskState::Stopping);
        let second = apply(first.state, TaskSignal::WorkerDone { success: true }).unwrap_err();
        assert!(second.is_superseded());
        let third = apply(TaskState::Stopped, TaskSignal::WorkerDone { success: false }).unwrap_err();
        assert!(third.is_superseded());
    }

    #[test]
    fn test_stop_request_from_any_active_state() {
        for state in [
            TaskState::Init,
            TaskState::Scheduled,
            TaskState::SettingUp,
            TaskState::Running,
        ] {
            let t = apply(state, TaskSignal::StopRequested).unwrap();
            assert_eq!(t.state, TaskState::Stopping);
            assert!(t.error.is_none());
        }
    }

    #[test]
    fn test_cleanup_completes_stopping_task() {
        let t = apply(TaskState::Stopping, TaskSignal::CleanupComplete).unwrap();
        assert_eq!(t.state, TaskState::Stopped);
    }

    #[test]
    fn test_cleanup_on_running_task_is_invalid() {
        let r = apply(TaskState::Running, TaskSignal::CleanupComplete).unwrap_err();
        assert!(matches!(r, Rejection::Invalid { .. }));
    }

    #[test]
    fn test_stopped_is_frozen() {
        for signal in [
            TaskSignal::Assigned,
            TaskSignal::WorkerRunning,
            TaskSignal::WorkerDone { success: true },
            TaskSignal::StopRequested,
            TaskSignal::CleanupComplete,
        ] {
            assert!(apply(TaskState::Stopped, signal).is_err());
        }
    }

    #[test]
    fn test_state_order_matches_lifecycle() {
        for pair in ALL_STATES.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_state_wire_format() {
        let json = serde_json::to_string(&TaskState::SettingUp).unwrap();
        assert_eq!(json, r#""setting_up""#);
    }
}
