use crate::models::ElectionStatus;
use std::fmt;

/// The guarded operations of an election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    AddCandidate,
    CastBallot,
    MoveToVoting,
    MarkComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Proceed,
    /// The transition already happened; the call is a no-op.
    AlreadyDone,
}

impl Operation {
    /// Decides whether the operation may run against an election in `status`.
    /// `None` means the status forbids it.
    pub fn admit(self, status: ElectionStatus) -> Option<Admission> {
        use ElectionStatus::*;
        match (self, status) {
            (Operation::AddCandidate, InCreation) => Some(Admission::Proceed),
            (Operation::CastBallot, Voting) => Some(Admission::Proceed),
            (Operation::MoveToVoting, InCreation) => Some(Admission::Proceed),
            (Operation::MoveToVoting, Voting) => Some(Admission::AlreadyDone),
            (Operation::MarkComplete, Voting) => Some(Admission::Proceed),
            (Operation::MarkComplete, Complete) => Some(Admission::AlreadyDone),
            _ => None,
        }
    }

    /// Status an election ends up in after the operation, for transitions.
    pub fn target(self) -> Option<ElectionStatus> {
        match self {
            Operation::MoveToVoting => Some(ElectionStatus::Voting),
            Operation::MarkComplete => Some(ElectionStatus::Complete),
            Operation::AddCandidate | Operation::CastBallot => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::AddCandidate => "add a candidate to",
            Operation::CastBallot => "vote in",
            Operation::MoveToVoting => "start voting in",
            Operation::MarkComplete => "complete",
        })
    }
}
