//! Quota engine errors.

use skiff_core::ErrorKind;
use thiserror::Error;

use crate::engine::QuotaSubject;

pub type QuotaResult<T> = Result<T, QuotaError>;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("quota exceeded for {subject}: {dimension}")]
    Exceeded {
        subject: QuotaSubject,
        dimension: &'static str,
    },
}

impl QuotaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QuotaError::Exceeded { .. } => ErrorKind::QuotaExceeded,
        }
    }
}
