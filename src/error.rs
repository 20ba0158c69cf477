use crate::db::StoreError;
use crate::election::lifecycle::Operation;
use crate::models::ElectionStatus;
use crate::voting::BallotError;
use thiserror::Error;

/// Errors surfaced synchronously by the public election operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] BallotError),
    #[error("cannot {operation} election {election_id} with status {status}")]
    InvalidElectionStatus {
        election_id: String,
        status: ElectionStatus,
        operation: Operation,
    },
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for EngineError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(what) => EngineError::NotFound(what),
            StoreError::InvalidBallot(ballot) => EngineError::Validation(ballot),
            other => EngineError::Store(other),
        }
    }
}
