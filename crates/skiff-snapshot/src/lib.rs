//! skiff-snapshot: point-in-time checkpoints of running workloads.
//!
//! A snapshot is an immutable record pointing at checkpoint data held by
//! the substrate. Restoring never touches the source: it admits a fresh
//! workload through the orchestrator, seeded from the checkpoint.

pub mod error;
pub mod manager;

pub use error::{SnapshotError, SnapshotResult};
pub use manager::SnapshotManager;
