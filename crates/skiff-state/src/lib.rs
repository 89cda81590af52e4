//! skiff-state: the workload repository.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage of workloads, namespaces, secrets, and snapshot records.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Workload state changes go through [`Repository::update_state`], a
//! compare-and-swap executed inside a single write transaction, so two
//! concurrent callers can never both win the same transition.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod repository;
pub mod sealer;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use repository::Repository;
pub use sealer::SecretSealer;
pub use store::StateStore;
pub use types::*;
