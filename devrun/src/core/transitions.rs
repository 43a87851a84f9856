//! Allowed status transitions for runs and iterations.
//!
//! Every status write in the orchestrator goes through these checks so an
//! illegal move (e.g. reviving a canceled run from inside the loop) surfaces
//! as an error instead of silently rewriting history.

use anyhow::{Result, anyhow};

use crate::core::types::{IterationStatus, RunStatus};

impl RunStatus {
    /// Whether `self -> next` is a legal run transition. Staying put is always legal.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus as S;
        if self == next {
            return true;
        }
        match self {
            S::Queued => matches!(
                next,
                S::Running | S::WaitingCheckpoint | S::Failed | S::Canceled
            ),
            S::Running => matches!(
                next,
                S::WaitingCheckpoint | S::Succeeded | S::Failed | S::Canceled
            ),
            S::WaitingCheckpoint => matches!(
                next,
                S::Queued | S::Running | S::Failed | S::Canceled
            ),
            // Only an explicit retry may reopen a failed run.
            S::Failed => next == S::Queued,
            S::Succeeded | S::Canceled => false,
        }
    }
}

impl IterationStatus {
    /// Whether `self -> next` is a legal iteration transition.
    ///
    /// Any unfinished iteration may be reset to `PENDING` by a recovery operation.
    pub fn can_transition_to(self, next: IterationStatus) -> bool {
        use IterationStatus as S;
        if self == next {
            return true;
        }
        match (self, next) {
            (S::Deployed, _) => false,
            (_, S::Pending) => true,
            // An iteration whose attempt budget is spent fails without running.
            (S::Pending, S::Running | S::Failed) => true,
            (S::Running, S::Gated | S::Failed) => true,
            (S::Gated, S::Merged | S::Failed) => true,
            (S::Merged, S::Deployed | S::Failed) => true,
            _ => false,
        }
    }
}

pub fn ensure_run_transition(from: RunStatus, to: RunStatus) -> Result<()> {
    if from.can_transition_to(to) {
        return Ok(());
    }
    Err(anyhow!("illegal run transition {from} -> {to}"))
}

pub fn ensure_iteration_transition(from: IterationStatus, to: IterationStatus) -> Result<()> {
    if from.can_transition_to(to) {
        return Ok(());
    }
    Err(anyhow!("illegal iteration transition {from} -> {to}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_checkpoint_round_trip_is_legal() {
        assert!(RunStatus::Running.can_transition_to(RunStatus::WaitingCheckpoint));
        assert!(RunStatus::WaitingCheckpoint.can_transition_to(RunStatus::Running));
        assert!(RunStatus::WaitingCheckpoint.can_transition_to(RunStatus::Queued));
    }

    #[test]
    fn terminal_runs_stay_terminal() {
        assert!(!RunStatus::Succeeded.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Canceled.can_transition_to(RunStatus::Queued));
        assert!(RunStatus::Failed.can_transition_to(RunStatus::Queued));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Running));
        assert!(ensure_run_transition(RunStatus::Canceled, RunStatus::Running).is_err());
    }

    #[test]
    fn iteration_happy_path_and_reset() {
        use IterationStatus as S;
        let path = [S::Pending, S::Running, S::Gated, S::Merged, S::Deployed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
        assert!(S::Failed.can_transition_to(S::Pending));
        assert!(S::Running.can_transition_to(S::Pending));
        assert!(!S::Deployed.can_transition_to(S::Pending));
        assert!(!S::Pending.can_transition_to(S::Merged));
        assert!(S::Pending.can_transition_to(S::Failed));
        assert!(ensure_iteration_transition(S::Failed, S::Gated).is_err());
    }
}
