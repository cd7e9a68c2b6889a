//! Scaleset lifecycle state machine.
//!
//! A scaleset is an elastic group of node slots backing one pool. The
//! orchestrator only resizes scalesets that are stable (`Running`); actual
//! machine provisioning happens outside through the capacity backend.

use serde::{Deserialize, Serialize};

/// Scaleset lifecycle states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalesetState {
    /// Created, provisioning not yet started.
    #[default]
    Init,
    /// Backend is creating the underlying resources.
    Setup,
    /// Stable at its target size; eligible for resize.
    Running,
    /// A size change is in flight.
    Resize,
    /// Teardown requested; nodes are draining.
    Shutdown,
    /// Fully torn down.
    Halt,
}

impl ScalesetState {
    /// Only a stable scaleset may start a resize.
    pub fn can_resize(&self) -> bool {
        matches!(self, ScalesetState::Running)
    }

    /// True once the scaleset is on its way out.
    pub fn is_shutting_down(&self) -> bool {
        matches!(self, ScalesetState::Shutdown | ScalesetState::Halt)
    }

    /// Valid next steps in the lifecycle.
    pub fn can_transition_to(&self, next: ScalesetState) -> bool {
        use ScalesetState::*;
        matches!(
            (self, next),
            (Init, Setup)
                | (Setup, Running)
                | (Running, Resize)
                | (Resize, Running)
                | (Init, Shutdown)
                | (Setup, Shutdown)
                | (Running, Shutdown)
                | (Resize, Shutdown)
                | (Shutdown, Halt)
        )
    }
}

impl std::fmt::Display for ScalesetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScalesetState::Init => "init",
            ScalesetState::Setup => "setup",
            ScalesetState::Running => "running",
            ScalesetState::Resize => "resize",
            ScalesetState::Shutdown => "shutdown",
            ScalesetState::Halt => "halt",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ScalesetState::Init, ScalesetState::Setup)]
    #[case(ScalesetState::Setup, ScalesetState::Running)]
    #[case(ScalesetState::Running, ScalesetState::Resize)]
    #[case(ScalesetState::Resize, ScalesetState::Running)]
    #[case(ScalesetState::Running, ScalesetState::Shutdown)]
    #[case(ScalesetState::Shutdown, ScalesetState::Halt)]
    fn test_valid_transitions(#[case] from: ScalesetState, #[case] to: ScalesetState) {
        assert!(from.can_transition_to(to));
    }

    #[rstest]
    #[case(ScalesetState::Halt, ScalesetState::Running)]
    #[case(ScalesetState::Shutdown, ScalesetState::Running)]
    #[case(ScalesetState::Init, ScalesetState::Resize)]
    fn test_invalid_transitions(#[case] from: ScalesetState, #[case] to: ScalesetState) {
        assert!(!from.can_transition_to(to));
    }

    #[test]
    fn test_only_running_can_resize() {
        assert!(ScalesetState::Running.can_resize());
        assert!(!ScalesetState::Resize.can_resize());
        assert!(!ScalesetState::Shutdown.can_resize());
    }
}
