use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const ACTIVE_ID_LENGTH: usize = 6;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Election {
    pub id: String,
    pub active_id: String,
    pub status: ElectionStatus,
    pub creator_id: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<ElectionResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ElectionStatus {
    InCreation,
    Voting,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub election_id: String,
    pub business_id: String,
    pub nominator_id: Option<String>,
    pub distance: Option<f64>,
}

/// One voter's complete ranking, most preferred first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    pub voter_id: String,
    pub election_id: String,
    pub ranking: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundAction {
    Eliminated,
    Won,
    WonByTiebreak,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRoundResult {
    pub number_of_rank_one_votes: u64,
    pub round_action: Option<RoundAction>,
}

pub type ElectionRound = BTreeMap<String, CandidateRoundResult>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectionResult {
    pub rounds: Vec<ElectionRound>,
    pub calculated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayableElection {
    pub id: String,
    pub active_id: String,
    pub status: ElectionStatus,
    pub candidates: Vec<DisplayableCandidate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayableCandidate {
    pub business_id: String,
    pub name: String,
    pub nominator_nickname: String,
}

impl Election {
    pub fn new(creator_id: String, active_id: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            active_id,
            status: ElectionStatus::InCreation,
            creator_id,
            created_at: Utc::now(),
            completed_at: None,
            result: None,
        }
    }
}

impl ElectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ElectionStatus::InCreation => "IN_CREATION",
            ElectionStatus::Voting => "VOTING",
            ElectionStatus::Complete => "COMPLETE",
        }
    }
}

impl fmt::Display for ElectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ElectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN_CREATION" => Ok(ElectionStatus::InCreation),
            "VOTING" => Ok(ElectionStatus::Voting),
            "COMPLETE" => Ok(ElectionStatus::Complete),
            other => Err(format!("Unknown election status: {}", other)),
        }
    }
}

impl ElectionResult {
    pub fn new(rounds: Vec<ElectionRound>) -> Self {
        Self {
            rounds,
            calculated_at: Utc::now(),
        }
    }

    /// The candidate marked as winner in the final round, if any.
    pub fn winner(&self) -> Option<&str> {
        self.rounds.last().and_then(|round| {
            round
                .iter()
                .find(|(_, r)| {
                    matches!(
                        r.round_action,
                        Some(RoundAction::Won) | Some(RoundAction::WonByTiebreak)
                    )
                })
                .map(|(business_id, _)| business_id.as_str())
        })
    }
}
