use crate::db::{Database, StoreError};
use crate::models::ElectionResult;
use crate::stream::{ElectionUpdateEvent, UpdateHub};
use crate::tasks::queue::{Enqueued, JobError, JobHandler, JobQueue, JobStatus};
use crate::voting::{tabulate, TabulationError};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use thiserror::Error;

pub const RESULT_QUEUE_NAME: &str = "rcv_election_result_update_queue";

#[derive(Debug, Error)]
pub enum RecomputeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Tabulation(#[from] TabulationError),
}

/// Tabulates an election from its stored ballots and publishes the outcome.
pub struct ResultRecomputer {
    db: Arc<Database>,
    updates: Arc<UpdateHub>,
}

impl ResultRecomputer {
    pub fn new(db: Arc<Database>, updates: Arc<UpdateHub>) -> Self {
        Self { db, updates }
    }

    pub async fn recompute(&self, election_id: &str) -> Result<ElectionResult, RecomputeError> {
        let (candidates, ballots) = self.db.get_tabulation_input(election_id).await?;
        let result = ElectionResult::new(tabulate(&candidates, &ballots)?);
        self.db.store_result(election_id, &result).await?;
        info!(
            "Recomputed election {}: {} ballot(s), {} round(s), winner {:?}",
            election_id,
            ballots.len(),
            result.rounds.len(),
            result.winner()
        );

        let event = ElectionUpdateEvent::results_updated(result.clone());
        if let Err(e) = self.updates.for_election(election_id).publish(&event).await {
            warn!("Could not publish results for election {}: {}", election_id, e);
        }
        Ok(result)
    }
}

#[async_trait]
impl JobHandler for ResultRecomputer {
    async fn run(&self, key: &str) -> Result<(), JobError> {
        self.recompute(key).await?;
        Ok(())
    }
}

/// Turns "a ballot changed" into at most one pending tabulation per election.
pub struct RecomputeCoordinator {
    queue: Arc<dyn JobQueue>,
    recomputer: Arc<ResultRecomputer>,
}

impl RecomputeCoordinator {
    pub fn new(queue: Arc<dyn JobQueue>, recomputer: Arc<ResultRecomputer>) -> Self {
        Self { queue, recomputer }
    }

    pub async fn schedule_recompute(&self, election_id: &str) -> Enqueued {
        let outcome = self.queue.enqueue_if_absent(election_id).await;
        match outcome {
            Enqueued::Stopped => warn!("Result queue stopped, election {} not recomputed", election_id),
            other => debug!("Recompute for election {}: {:?}", election_id, other),
        }
        outcome
    }

    /// Tabulates on the caller's task once any queued or running job for the
    /// election is done. The election's job key stays held until it returns.
    pub async fn recompute_now(&self, election_id: &str) -> Result<ElectionResult, RecomputeError> {
        self.queue.claim(election_id).await;
        let mut claim = Claim {
            queue: self.queue.as_ref(),
            key: election_id,
            succeeded: false,
        };
        let outcome = self.recomputer.recompute(election_id).await;
        claim.succeeded = outcome.is_ok();
        outcome
    }

    pub async fn job_status(&self, election_id: &str) -> JobStatus {
        self.queue.status(election_id).await
    }
}

/// Releases a claimed job key even if the holder is dropped mid-way.
struct Claim<'a> {
    queue: &'a dyn JobQueue,
    key: &'a str,
    succeeded: bool,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.queue.release(self.key, self.succeeded);
    }
}
