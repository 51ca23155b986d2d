//! Phases of rounds and submissions.

use derive_more::Display;
use serde::{Deserialize, Serialize};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// The phase of a training round.
pub enum RoundPhase {
    Initialized,
    InProgress,
    Aggregating,
    Verifying,
    Completed,
    Failed,
}

impl RoundPhase {
    /// Checks whether the round can't change its phase anymore.
    pub fn is_terminal(self) -> bool {
        matches!(self, RoundPhase::Completed | RoundPhase::Failed)
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// The verification phase of a submitted update.
pub enum SubmissionPhase {
    Pending,
    Submitted,
    Verified,
    Aggregated,
    Failed,
}

impl SubmissionPhase {
    /// Checks whether a submission may move from this phase to `next`.
    ///
    /// Submissions only move forward and never return to `Pending`.
    pub fn can_transition_to(self, next: SubmissionPhase) -> bool {
        use SubmissionPhase::*;
        matches!(
            (self, next),
            (Pending, Submitted)
                | (Pending, Failed)
                | (Submitted, Verified)
                | (Submitted, Failed)
                | (Verified, Aggregated)
                | (Verified, Failed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_transitions_are_monotonic() {
        use SubmissionPhase::*;
        let all = [Pending, Submitted, Verified, Aggregated, Failed];
        for phase in &all {
            assert!(!phase.can_transition_to(Pending));
            assert!(!phase.can_transition_to(*phase));
        }
        for phase in &[Aggregated, Failed] {
            assert!(all.iter().all(|next| !phase.can_transition_to(*next)));
        }
        assert!(Submitted.can_transition_to(Verified));
        assert!(!Submitted.can_transition_to(Aggregated));
    }

    #[test]
    fn test_terminal_phases() {
        assert!(RoundPhase::Completed.is_terminal());
        assert!(RoundPhase::Failed.is_terminal());
        assert!(!RoundPhase::Verifying.is_terminal());
        assert_eq!(RoundPhase::InProgress.to_string(), "InProgress");
    }
}
