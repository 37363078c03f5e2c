//! Error taxonomy shared by the store, aggregator and orchestrator.

use thiserror::Error;
use uuid::Uuid;

use crate::lifecycle::RoundStatus;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("round {0} not found")]
    RoundNotFound(Uuid),
    #[error("model {0} not found")]
    ModelNotFound(String),
    #[error("contribution for device {device_id} in round {round_id} not found")]
    ContributionNotFound { round_id: Uuid, device_id: String },
    #[error("round {round_id} is already {status} and cannot be modified")]
    TerminalState { round_id: Uuid, status: RoundStatus },
    #[error("round {round_id} cannot move from {from} to {to}")]
    InvalidTransition { round_id: Uuid, from: RoundStatus, to: RoundStatus },
    #[error("privacy ledger for model {model_id} expected cumulative epsilon {expected}, got {got}")]
    LedgerMismatch { model_id: String, expected: f64, got: f64 },
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Only backend failures are worth another attempt; everything else is a logic error.
    pub fn is_transient(&self) -> bool { matches!(self, StoreError::Backend(_)) }
}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self { StoreError::Backend(e.to_string()) }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AggregationError {
    #[error("no local updates to aggregate")]
    NoUpdates,
    #[error("update from device {device_id} does not match the global model: {reason}")]
    ShapeMismatch { device_id: String, reason: String },
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("round {0} not found")]
    RoundNotFound(Uuid),
    #[error("round {0} has no participating devices and no online devices are available")]
    NoDevicesAssigned(Uuid),
    #[error("round {0} is already running")]
    AlreadyRunning(Uuid),
    #[error("round {round_id} is {status}; only pending rounds can be started")]
    InvalidState { round_id: Uuid, status: RoundStatus },
    #[error("round {0} was cancelled")]
    Cancelled(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
}

pub type StoreResult<T> = Result<T, StoreError>;
