//! Lifecycle error types.

use skiff_core::ErrorKind;
use skiff_state::WorkloadState;
use thiserror::Error;

/// Errors that can occur during lifecycle operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("workload {id} is {state}, not running")]
    NotRunning { id: String, state: WorkloadState },

    #[error("{0}")]
    Forbidden(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("background task failed: {0}")]
    Task(String),

    #[error(transparent)]
    State(#[from] skiff_state::StateError),

    #[error(transparent)]
    Quota(#[from] skiff_quota::QuotaError),

    #[error(transparent)]
    Substrate(#[from] skiff_substrate::SubstrateError),
}

impl LifecycleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LifecycleError::NotRunning { .. } => ErrorKind::NotRunning,
            LifecycleError::Forbidden(_) => ErrorKind::Forbidden,
            LifecycleError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            LifecycleError::Conflict(_) => ErrorKind::Conflict,
            LifecycleError::Task(_) => ErrorKind::Internal,
            LifecycleError::State(e) => e.kind(),
            LifecycleError::Quota(e) => e.kind(),
            LifecycleError::Substrate(e) => e.kind(),
        }
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
