//! Substrate errors.

use skiff_core::ErrorKind;
use thiserror::Error;

pub type SubstrateResult<T> = Result<T, SubstrateError>;

#[derive(Debug, Clone, Error)]
pub enum SubstrateError {
    /// Worth retrying: timeouts, contention, temporarily missing capacity.
    #[error("transient substrate error: {0}")]
    Transient(String),

    /// Retrying will not help.
    #[error("substrate error: {0}")]
    Fatal(String),

    #[error("not found on substrate: {0}")]
    NotFound(String),

    /// The request itself is unacceptable (for example a path escaping the
    /// workload root).
    #[error("rejected by substrate: {0}")]
    Rejected(String),
}

impl SubstrateError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SubstrateError::Transient(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SubstrateError::Transient(_) => ErrorKind::SubstrateError,
            SubstrateError::Fatal(_) => ErrorKind::Fatal,
            SubstrateError::NotFound(_) => ErrorKind::NotFound,
            SubstrateError::Rejected(_) => ErrorKind::InvalidRequest,
        }
    }
}

impl From<std::io::Error> for SubstrateError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match e.kind() {
            Io::NotFound => SubstrateError::NotFound(e.to_string()),
            Io::TimedOut | Io::Interrupted | Io::WouldBlock | Io::ResourceBusy => {
                SubstrateError::Transient(e.to_string())
            }
            _ => SubstrateError::Fatal(e.to_string()),
        }
    }
}
