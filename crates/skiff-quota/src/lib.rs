//! skiff-quota: resource admission.
//!
//! Every workload holds a reservation against two subjects at once: its
//! owning principal and its namespace. A reservation is granted only if
//! both ceilings still hold after adding it; the check and the update
//! happen under one lock, so concurrent reservations can never jointly
//! overshoot.

pub mod engine;
pub mod error;

pub use engine::{QuotaEngine, QuotaReport, QuotaSubject, Token, Usage};
pub use error::{QuotaError, QuotaResult};
