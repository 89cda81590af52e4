//! Auth gate errors.

use skiff_core::ErrorKind;
use skiff_state::StateError;
use thiserror::Error;

use crate::scope::Scope;

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Missing, unknown, or revoked key.
    #[error("invalid or missing API key")]
    Unauthorized,

    #[error("key lacks the '{0}' scope")]
    Forbidden(Scope),

    #[error("API key not found: {0}")]
    NotFound(String),

    #[error("unknown scope: {0}")]
    InvalidScope(String),

    #[error("stored API key {id} is unreadable: {reason}")]
    InvalidRecord { id: String, reason: String },

    #[error(transparent)]
    State(#[from] StateError),
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::Unauthorized => ErrorKind::Unauthorized,
            AuthError::Forbidden(_) => ErrorKind::Forbidden,
            AuthError::NotFound(_) => ErrorKind::NotFound,
            AuthError::InvalidScope(_) => ErrorKind::InvalidRequest,
            AuthError::InvalidRecord { .. } => ErrorKind::Internal,
            AuthError::State(e) => e.kind(),
        }
    }
}
