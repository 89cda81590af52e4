//! Error types for the Skiff repository.

use skiff_core::ErrorKind;
use thiserror::Error;

use crate::types::WorkloadState;

/// Result type alias for repository operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during repository operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Compare-and-swap lost: the record was not in the expected state.
    #[error("workload {id} is {actual}, expected {expected}")]
    Conflict {
        id: String,
        expected: WorkloadState,
        actual: WorkloadState,
    },

    #[error("workload {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: WorkloadState,
        to: WorkloadState,
    },

    #[error("{0} still has live workloads")]
    NotEmpty(String),

    #[error("secret sealing error: {0}")]
    Seal(String),
}

impl StateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StateError::NotFound(_) => ErrorKind::NotFound,
            StateError::AlreadyExists(_)
            | StateError::Conflict { .. }
            | StateError::InvalidTransition { .. } => ErrorKind::Conflict,
            StateError::NotEmpty(_) => ErrorKind::InUse,
            _ => ErrorKind::Internal,
        }
    }
}
