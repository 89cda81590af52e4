//! Snapshot error types.

use skiff_core::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot {0} is in use by a restore")]
    InUse(String),

    #[error("{0}")]
    Forbidden(String),

    #[error(transparent)]
    Lifecycle(#[from] skiff_lifecycle::LifecycleError),

    #[error(transparent)]
    State(#[from] skiff_state::StateError),

    #[error(transparent)]
    Substrate(#[from] skiff_substrate::SubstrateError),
}

impl SnapshotError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SnapshotError::InUse(_) => ErrorKind::InUse,
            SnapshotError::Forbidden(_) => ErrorKind::Forbidden,
            SnapshotError::Lifecycle(e) => e.kind(),
            SnapshotError::State(e) => e.kind(),
            SnapshotError::Substrate(e) => e.kind(),
        }
    }
}

pub type SnapshotResult<T> = Result<T, SnapshotError>;
