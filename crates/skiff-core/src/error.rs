//! Stable error kinds shared by every Skiff subsystem.
//!
//! Each crate keeps its own `thiserror` enum; all of them project onto an
//! `ErrorKind` so the API can hand clients a tag that never changes with the
//! wording of a message.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Machine-readable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing, unknown, or revoked credential.
    Unauthorized,
    /// Valid credential without the required scope or ownership.
    Forbidden,
    NotFound,
    /// Compare-and-swap mismatch caused by a concurrent mutation.
    Conflict,
    QuotaExceeded,
    /// The operation requires a Running workload.
    NotRunning,
    /// The workload left Running while a session was attached or opening.
    WorkloadUnavailable,
    /// Blocked by a dependent in-flight operation.
    InUse,
    /// Transient substrate failure (retries were exhausted or not applicable).
    SubstrateError,
    /// Non-transient substrate or configuration failure.
    Fatal,
    /// The request itself is malformed or violates a policy.
    InvalidRequest,
    Internal,
}

impl ErrorKind {
    /// The wire tag for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::NotRunning => "not_running",
            ErrorKind::WorkloadUnavailable => "workload_unavailable",
            ErrorKind::InUse => "in_use",
            ErrorKind::SubstrateError => "substrate_error",
            ErrorKind::Fatal => "fatal",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether an automatic retry could change the outcome.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::SubstrateError)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
