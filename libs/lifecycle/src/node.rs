//! Node lifecycle state machine.
//!
//! Nodes cycle rather than march forward:
//! `Init → SettingUp → Ready ⇄ Busy`, with `Free` and `Done` covering an
//! idle node pending teardown. Because of the cycle, validity is an
//! adjacency table instead of an ordering, and teardown flags
//! (reimage/delete) are deferred-effect: they only bite when the node next
//! reports an idle state.

use serde::{Deserialize, Serialize};

/// Node lifecycle states.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Registered, agent not yet set up.
    #[default]
    Init,
    /// Agent preparing the machine.
    SettingUp,
    /// Idle and schedulable.
    Ready,
    /// Running a task.
    Busy,
    /// Idle, no longer schedulable, pending teardown.
    Free,
    /// Agent finished; the machine is waiting to be reclaimed.
    Done,
}

impl NodeState {
    /// States in which the node is not executing work.
    pub fn is_idle(&self) -> bool {
        matches!(self, NodeState::Ready | NodeState::Free | NodeState::Done)
    }

    /// Only `Ready` nodes accept new work.
    pub fn can_schedule(&self) -> bool {
        matches!(self, NodeState::Ready)
    }

    /// Returns true if the reported state is a valid next step from `self`.
    ///
    /// Unknown machines aside, agents only ever report states reachable
    /// from what the orchestrator last recorded; anything else is stale or
    /// impossible and gets discarded.
    pub fn can_transition_to(&self, next: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, next),
            (Init, SettingUp)
                | (Init, Ready)
                | (Init, Done)
                | (SettingUp, Ready)
                | (SettingUp, Done)
                | (Ready, Busy)
                | (Ready, Free)
                | (Ready, Done)
                | (Busy, Ready)
                | (Busy, Free)
                | (Busy, Done)
                | (Free, Done)
        )
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeState::Init => "init",
            NodeState::SettingUp => "setting_up",
            NodeState::Ready => "ready",
            NodeState::Busy => "busy",
            NodeState::Free => "free",
            NodeState::Done => "done",
        };
        write!(f, "{}", s)
    }
}

/// Deferred-effect teardown flags carried on the node record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFlags {
    pub reimage_requested: bool,
    pub delete_requested: bool,
}

impl NodeFlags {
    /// True once either flag is set; the node must not take further work.
    pub fn teardown_requested(&self) -> bool {
        self.reimage_requested || self.delete_requested
    }
}

/// What the reconciler should do with a reported node state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeDecision {
    /// Record the reported state.
    Advance(NodeState),
    /// Teardown was requested and the node is idle: keep the recorded
    /// state unchanged and tell the agent to stop.
    HoldForTeardown,
    /// Duplicate or impossible report; discard without mutation.
    Ignore,
}

/// Plans the response to an agent-reported node state.
///
/// The recorded state never advances past idle while a teardown flag is
/// set; the agent is instead commanded to stop, and the state moves on
/// only once the agent confirms shutdown by reporting `Done`.
pub fn plan(current: NodeState, reported: NodeState, flags: NodeFlags) -> NodeDecision {
    if reported != current && !current.can_transition_to(reported) {
        return NodeDecision::Ignore;
    }

    // Done is the shutdown confirmation itself and always records; the
    // hold applies to the idle states that precede it.
    if matches!(reported, NodeState::Ready | NodeState::Free) && flags.teardown_requested() {
        return NodeDecision::HoldForTeardown;
    }

    if reported == current {
        return NodeDecision::Ignore;
    }

    NodeDecision::Advance(reported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const NO_FLAGS: NodeFlags = NodeFlags {
        reimage_requested: false,
        delete_requested: false,
    };

    const REIMAGE: NodeFlags = NodeFlags {
        reimage_requested: true,
        delete_requested: false,
    };

    #[rstest]
    #[case(NodeState::Init, NodeState::SettingUp)]
    #[case(NodeState::SettingUp, NodeState::Ready)]
    #[case(NodeState::Ready, NodeState::Busy)]
    #[case(NodeState::Busy, NodeState::Ready)]
    #[case(NodeState::Busy, NodeState::Done)]
    #[case(NodeState::Free, NodeState::Done)]
    fn test_normal_cycle_advances(#[case] from: NodeState, #[case] to: NodeState) {
        assert_eq!(plan(from, to, NO_FLAGS), NodeDecision::Advance(to));
    }

    #[rstest]
    #[case(NodeState::Done, NodeState::Ready)]
    #[case(NodeState::Ready, NodeState::Init)]
    #[case(NodeState::Busy, NodeState::SettingUp)]
    #[case(NodeState::Free, NodeState::Busy)]
    fn test_impossible_reports_are_ignored(#[case] from: NodeState, #[case] to: NodeState) {
        assert_eq!(plan(from, to, NO_FLAGS), NodeDecision::Ignore);
    }

    #[test]
    fn test_duplicate_report_is_ignored() {
        assert_eq!(
            plan(NodeState::Busy, NodeState::Busy, NO_FLAGS),
            NodeDecision::Ignore
        );
    }

    #[test]
    fn test_reimage_holds_node_entering_free() {
        // The recorded state must not change; the caller enqueues a stop.
        assert_eq!(
            plan(NodeState::Busy, NodeState::Free, REIMAGE),
            NodeDecision::HoldForTeardown
        );
    }

    #[test]
    fn test_delete_holds_node_entering_ready() {
        let flags = NodeFlags {
            reimage_requested: false,
            delete_requested: true,
        };
        assert_eq!(
            plan(NodeState::Busy, NodeState::Ready, flags),
            NodeDecision::HoldForTeardown
        );
    }

    #[test]
    fn test_teardown_flag_reapplies_on_duplicate_idle_report() {
        // An already-idle node re-reporting idle while flagged still gets a
        // stop command; the queue is at-least-once, so repeats are safe.
        assert_eq!(
            plan(NodeState::Ready, NodeState::Ready, REIMAGE),
            NodeDecision::HoldForTeardown
        );
    }

    #[test]
    fn test_done_report_confirms_shutdown_despite_flags() {
        // Done is the confirmation the hold was waiting for; refusing to
        // record it would wedge the node forever.
        assert_eq!(
            plan(NodeState::Free, NodeState::Done, REIMAGE),
            NodeDecision::Advance(NodeState::Done)
        );
        assert_eq!(
            plan(NodeState::Ready, NodeState::Done, REIMAGE),
            NodeDecision::Advance(NodeState::Done)
        );
    }

    #[test]
    fn test_busy_report_unaffected_by_flags() {
        // Flags only bite on idle entry; a node reporting busy keeps going.
        assert_eq!(
            plan(NodeState::Ready, NodeState::Busy, REIMAGE),
            NodeDecision::Advance(NodeState::Busy)
        );
    }

    #[test]
    fn test_only_ready_is_schedulable() {
        assert!(NodeState::Ready.can_schedule());
        for state in [
            NodeState::Init,
            NodeState::SettingUp,
            NodeState::Busy,
            NodeState::Free,
            NodeState::Done,
        ] {
            assert!(!state.can_schedule());
        }
    }

    #[test]
    fn test_idle_states() {
        assert!(NodeState::Ready.is_idle());
        assert!(NodeState::Free.is_idle());
        assert!(NodeState::Done.is_idle());
        assert!(!NodeState::Busy.is_idle());
        assert!(!NodeState::SettingUp.is_idle());
    }
}
