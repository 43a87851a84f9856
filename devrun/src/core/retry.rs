//! Attempt budget and checkpoint decisions for iterations.

/// Automatic attempts an iteration gets before it must be reset by an operator.
pub const MAX_ITERATION_ATTEMPTS: u32 = 3;

/// Why an iteration stopped retrying and parked the run at a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointReason {
    /// Baby-step mode pauses after the first failed attempt.
    BabyStep,
    /// The attempt budget is spent.
    AttemptsExhausted,
}

impl CheckpointReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointReason::BabyStep => "baby_step",
            CheckpointReason::AttemptsExhausted => "attempts_exhausted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptDecision {
    Retry,
    Checkpoint(CheckpointReason),
}

/// An iteration may start another automatic attempt only while budget remains.
pub fn can_start_attempt(attempt_count: u32) -> bool {
    attempt_count < MAX_ITERATION_ATTEMPTS
}

pub fn attempts_remaining(attempt_count: u32) -> u32 {
    MAX_ITERATION_ATTEMPTS.saturating_sub(attempt_count)
}

/// Decide what happens after attempt number `attempt` (1-based) failed.
pub fn decide_after_failure(attempt: u32, baby_step: bool) -> AttemptDecision {
    if baby_step {
        return AttemptDecision::Checkpoint(CheckpointReason::BabyStep);
    }
    if can_start_attempt(attempt) {
        AttemptDecision::Retry
    } else {
        AttemptDecision::Checkpoint(CheckpointReason::AttemptsExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_until_budget_is_spent() {
        assert_eq!(decide_after_failure(1, false), AttemptDecision::Retry);
        assert_eq!(decide_after_failure(2, false), AttemptDecision::Retry);
        assert_eq!(
            decide_after_failure(3, false),
            AttemptDecision::Checkpoint(CheckpointReason::AttemptsExhausted)
        );
    }

    #[test]
    fn baby_step_pauses_after_first_failure() {
        assert_eq!(
            decide_after_failure(1, true),
            AttemptDecision::Checkpoint(CheckpointReason::BabyStep)
        );
    }

    #[test]
    fn no_fourth_automatic_attempt() {
        assert!(can_start_attempt(2));
        assert!(!can_start_attempt(MAX_ITERATION_ATTEMPTS));
        assert!(!can_start_attempt(MAX_ITERATION_ATTEMPTS + 1));
        assert_eq!(attempts_remaining(1), 2);
        assert_eq!(attempts_remaining(5), 0);
    }
}
