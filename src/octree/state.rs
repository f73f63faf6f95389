//! Build protocol state machine.
//!
//! Replaces the ad hoc gate booleans of older builders with one explicit
//! state. A build request arriving outside `Idle` is reported as skipped;
//! every other out-of-order call is an error, never a silent no-op.

use crate::error::{SvoError, SvoResult};

/// Lifecycle of one build, from the submitting thread's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    /// No build in flight; stable buffers are consistent
    Idle,
    /// Level-loop commands are being recorded/submitted
    LevelLoopRunning,
    /// Level loop submitted; end-of-build readback outstanding
    ReadbackPending,
    /// Readback complete (post-pass done); finalize copy not yet issued
    FinalizePending,
}

impl BuildState {
    /// Legal transitions. `ReadbackPending -> Idle` is the timeout/abandon
    /// recovery path.
    pub fn can_transition(self, to: BuildState) -> bool {
        use BuildState::*;
        matches!(
            (self, to),
            (Idle, LevelLoopRunning)
                | (LevelLoopRunning, ReadbackPending)
                | (ReadbackPending, FinalizePending)
                | (ReadbackPending, Idle)
                | (FinalizePending, Idle)
        )
    }
}

/// Outcome of a build request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildRequest {
    Submitted,
    /// A build was already in flight; state is untouched
    SkippedBuildInFlight,
}

/// Single-flight gate wrapping [`BuildState`].
#[derive(Debug)]
pub struct BuildGate {
    state: BuildState,
}

impl BuildGate {
    pub fn new() -> Self {
        Self {
            state: BuildState::Idle,
        }
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    /// Claims the gate for a new build, or reports the request skipped.
    pub fn try_begin(&mut self) -> BuildRequest {
        if self.state == BuildState::Idle {
            self.state = BuildState::LevelLoopRunning;
            BuildRequest::Submitted
        } else {
            log::debug!("build request skipped, builder is {:?}", self.state);
            BuildRequest::SkippedBuildInFlight
        }
    }

    pub fn advance(&mut self, to: BuildState) -> SvoResult<()> {
        if self.state.can_transition(to) {
            self.state = to;
            Ok(())
        } else {
            Err(SvoError::InvalidTransition {
                from: self.state,
                to,
            })
        }
    }
}

impl Default for BuildGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::BuildState::*;
    use super::*;

    #[test]
    fn full_build_cycle() {
        let mut gate = BuildGate::new();
        assert_eq!(gate.try_begin(), BuildRequest::Submitted);
        gate.advance(ReadbackPending).unwrap();
        gate.advance(FinalizePending).unwrap();
        gate.advance(Idle).unwrap();
        assert_eq!(gate.state(), Idle);
    }

    #[test]
    fn second_request_is_skipped_not_errored() {
        let mut gate = BuildGate::new();
        assert_eq!(gate.try_begin(), BuildRequest::Submitted);
        assert_eq!(gate.try_begin(), BuildRequest::SkippedBuildInFlight);
        // the skipped request left the state untouched
        assert_eq!(gate.state(), LevelLoopRunning);
    }

    #[test]
    fn timeout_recovery_path() {
        let mut gate = BuildGate::new();
        gate.try_begin();
        gate.advance(ReadbackPending).unwrap();
        gate.advance(Idle).unwrap();
    }

    #[test]
    fn rejects_out_of_order_transitions() {
        let mut gate = BuildGate::new();
        let err = gate.advance(FinalizePending).unwrap_err();
        assert!(matches!(
            err,
            SvoError::InvalidTransition {
                from: Idle,
                to: FinalizePending
            }
        ));

        gate.try_begin();
        assert!(gate.advance(Idle).is_err());
        // failed transition leaves state untouched
        assert_eq!(gate.state(), LevelLoopRunning);
    }

    #[test]
    fn transition_table_is_exact() {
        let all = [Idle, LevelLoopRunning, ReadbackPending, FinalizePending];
        let legal = [
            (Idle, LevelLoopRunning),
            (LevelLoopRunning, ReadbackPending),
            (ReadbackPending, FinalizePending),
            (ReadbackPending, Idle),
            (FinalizePending, Idle),
        ];
        for from in all {
            for to in all {
                assert_eq!(from.can_transition(to), legal.contains(&(from, to)));
            }
        }
    }
}
