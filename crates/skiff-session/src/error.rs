//! Session error types.

use skiff_core::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The workload left Running while the session was being set up.
    #[error("workload {0} is no longer running")]
    WorkloadUnavailable(String),

    #[error(transparent)]
    Lifecycle(#[from] skiff_lifecycle::LifecycleError),

    #[error(transparent)]
    State(#[from] skiff_state::StateError),

    #[error(transparent)]
    Substrate(#[from] skiff_substrate::SubstrateError),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::WorkloadUnavailable(_) => ErrorKind::WorkloadUnavailable,
            SessionError::Lifecycle(e) => e.kind(),
            SessionError::State(e) => e.kind(),
            SessionError::Substrate(e) => e.kind(),
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
