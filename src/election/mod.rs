pub mod active_id;
pub mod lifecycle;

use crate::db::{Database, StoreError};
use crate::directory::{display_name_or_id, nickname_or_unknown, BusinessDirectory, UserDirectory};
use crate::error::EngineError;
use crate::models::{
    Candidate, DisplayableCandidate, DisplayableElection, Election, ElectionResult, ElectionStatus,
};
use crate::stream::{ElectionUpdateEvent, UpdateHub};
use crate::tasks::RecomputeCoordinator;
use chrono::Utc;
use futures_util::stream::BoxStream;
use lifecycle::{Admission, Operation};
use log::{debug, info, warn};
use std::sync::Arc;

pub use active_id::{generate_active_id, normalize_active_id};

const DEFAULT_ACTIVE_ID_ATTEMPTS: usize = 10;

/// Guarded operations over elections, candidates and ballots.
///
/// Every guard re-reads the election's status right before writing; status
/// transitions are additionally written conditionally on the expected prior status.
pub struct ElectionManager {
    db: Arc<Database>,
    coordinator: Arc<RecomputeCoordinator>,
    updates: Arc<UpdateHub>,
    businesses: Arc<dyn BusinessDirectory>,
    users: Arc<dyn UserDirectory>,
    active_id_attempts: usize,
}

impl ElectionManager {
    pub fn new(
        db: Arc<Database>,
        coordinator: Arc<RecomputeCoordinator>,
        updates: Arc<UpdateHub>,
        businesses: Arc<dyn BusinessDirectory>,
        users: Arc<dyn UserDirectory>,
    ) -> Self {
        Self {
            db,
            coordinator,
            updates,
            businesses,
            users,
            active_id_attempts: DEFAULT_ACTIVE_ID_ATTEMPTS,
        }
    }

    pub fn with_active_id_attempts(mut self, attempts: usize) -> Self {
        self.active_id_attempts = attempts.max(1);
        self
    }

    pub async fn create_election(&self, creator_id: &str) -> Result<Election, EngineError> {
        for _ in 0..self.active_id_attempts {
            let election = Election::new(creator_id.to_string(), generate_active_id());
            if self.db.create_election(&election).await? {
                info!("Created election {} with code {}", election.id, election.active_id);
                return Ok(election);
            }
            debug!("Active id {} is taken, drawing another", election.active_id);
        }
        Err(StoreError::ActiveIdExhausted(self.active_id_attempts).into())
    }

    pub async fn get_election(&self, election_id: &str) -> Result<Election, EngineError> {
        Ok(self.db.get_election(election_id).await?)
    }

    /// The open election behind a shareable code.
    pub async fn get_open_election(&self, active_id: &str) -> Result<Election, EngineError> {
        let code = normalize_active_id(active_id)
            .ok_or_else(|| EngineError::NotFound(format!("Election with active id {}", active_id)))?;
        Ok(self.db.get_open_election(&code).await?)
    }

    pub async fn get_candidates(&self, active_id: &str) -> Result<Vec<Candidate>, EngineError> {
        let election = self.get_open_election(active_id).await?;
        Ok(self.db.get_candidates(&election.id).await?)
    }

    /// Last computed result, `None` until the first recompute has finished.
    pub async fn get_election_result(&self, election_id: &str) -> Result<Option<ElectionResult>, EngineError> {
        Ok(self.db.get_result(election_id).await?)
    }

    pub async fn get_displayable_election(&self, election_id: &str) -> Result<DisplayableElection, EngineError> {
        let election = self.db.get_election(election_id).await?;
        let mut candidates = Vec::new();
        for candidate in self.db.get_candidates(&election.id).await? {
            candidates.push(DisplayableCandidate {
                name: display_name_or_id(self.businesses.as_ref(), &candidate.business_id).await,
                nominator_nickname: nickname_or_unknown(self.users.as_ref(), candidate.nominator_id.as_deref())
                    .await,
                business_id: candidate.business_id,
            });
        }

        Ok(DisplayableElection {
            id: election.id,
            active_id: election.active_id,
            status: election.status,
            candidates,
        })
    }

    /// Nominates a business. Returns `false` if it was already a candidate.
    pub async fn add_candidate(
        &self,
        active_id: &str,
        business_id: &str,
        nominator_id: &str,
    ) -> Result<bool, EngineError> {
        let election = self.get_open_election(active_id).await?;
        admit(Operation::AddCandidate, &election.id, election.status)?;

        let candidate = Candidate {
            election_id: election.id.clone(),
            business_id: business_id.to_string(),
            nominator_id: Some(nominator_id.to_string()),
            distance: None,
        };
        match self.db.add_candidate(&candidate).await {
            Ok(()) => {}
            Err(StoreError::DuplicateCandidate) => {
                debug!("{} already nominated in election {}", business_id, election.id);
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }
        info!("{} nominated {} in election {}", nominator_id, business_id, election.id);

        let name = display_name_or_id(self.businesses.as_ref(), business_id).await;
        let nickname = nickname_or_unknown(self.users.as_ref(), Some(nominator_id)).await;
        self.publish(
            &election.id,
            ElectionUpdateEvent::candidate_added(business_id, &name, &nickname),
        )
        .await;
        Ok(true)
    }

    pub async fn move_to_voting(&self, election_id: &str) -> Result<(), EngineError> {
        let status = self.db.get_election_status(election_id).await?;
        if admit(Operation::MoveToVoting, election_id, status)? == Admission::AlreadyDone {
            return Ok(());
        }
        if self.db.count_candidates(election_id).await? == 0 {
            return Err(invalid_status(Operation::MoveToVoting, election_id, status));
        }

        if self.transition(Operation::MoveToVoting, election_id, status, None).await? {
            self.publish(election_id, ElectionUpdateEvent::status_changed(ElectionStatus::Voting))
                .await;
        }
        Ok(())
    }

    /// Closes voting. The result is recomputed once more before the status flips.
    pub async fn mark_complete(&self, election_id: &str) -> Result<(), EngineError> {
        let status = self.db.get_election_status(election_id).await?;
        if admit(Operation::MarkComplete, election_id, status)? == Admission::AlreadyDone {
            return Ok(());
        }

        let final_recompute = self.coordinator.recompute_now(election_id).await;

        let changed = self
            .transition(Operation::MarkComplete, election_id, status, Some(Utc::now()))
            .await?;

        if let Err(e) = final_recompute {
            warn!("Final recompute of election {} failed, retrying in background: {}", election_id, e);
            self.coordinator.schedule_recompute(election_id).await;
        }
        if changed {
            info!("Election {} complete", election_id);
            self.publish(election_id, ElectionUpdateEvent::status_changed(ElectionStatus::Complete))
                .await;
        }
        Ok(())
    }

    /// Replaces the voter's ballot and schedules a recompute. Does not wait for tabulation.
    pub async fn cast_ballot(
        &self,
        voter_id: &str,
        election_id: &str,
        ranking: &[String],
    ) -> Result<(), EngineError> {
        let status = self.db.get_election_status(election_id).await?;
        admit(Operation::CastBallot, election_id, status)?;

        self.db.replace_ballot(voter_id, election_id, ranking).await?;
        debug!("{} voted in election {}", voter_id, election_id);

        self.coordinator.schedule_recompute(election_id).await;
        Ok(())
    }

    /// Live updates for an existing election.
    pub async fn subscribe(
        &self,
        election_id: &str,
    ) -> Result<BoxStream<'static, ElectionUpdateEvent>, EngineError> {
        self.db.get_election_status(election_id).await?;
        Ok(self.updates.for_election(election_id).subscribe())
    }

    /// Writes `operation`'s status change if the election is still in `from`.
    /// Returns whether this call made the change.
    async fn transition(
        &self,
        operation: Operation,
        election_id: &str,
        from: ElectionStatus,
        completed_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<bool, EngineError> {
        let Some(to) = operation.target() else {
            return Ok(false);
        };
        if self.db.update_election_status(election_id, from, to, completed_at).await? {
            return Ok(true);
        }

        // Lost a race with another transition; settle on what is there now.
        let current = self.db.get_election_status(election_id).await?;
        admit(operation, election_id, current)?;
        if current == to {
            Ok(false)
        } else {
            Err(invalid_status(operation, election_id, current))
        }
    }

    async fn publish(&self, election_id: &str, event: ElectionUpdateEvent) {
        if let Err(e) = self.updates.for_election(election_id).publish(&event).await {
            warn!("Could not publish {} for election {}: {}", event.id, election_id, e);
        }
    }
}

fn admit(operation: Operation, election_id: &str, status: ElectionStatus) -> Result<Admission, EngineError> {
    operation
        .admit(status)
        .ok_or_else(|| invalid_status(operation, election_id, status))
}

fn invalid_status(operation: Operation, election_id: &str, status: ElectionStatus) -> EngineError {
    EngineError::InvalidElectionStatus {
        election_id: election_id.to_string(),
        status,
        operation,
    }
}
