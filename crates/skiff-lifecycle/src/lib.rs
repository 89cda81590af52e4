//! skiff-lifecycle: the workload lifecycle orchestrator.
//!
//! The orchestrator is the single writer of workload state. Every state
//! change is a compare-and-swap against the repository; a transition that
//! loses the race is abandoned, never retried blindly.
//!
//! # Architecture
//!
//! ```text
//! create ──► admit (template, namespace policy, secrets, quota)
//!              └── Pending ──► provision task
//!                               ├── Starting (handle recorded)
//!                               ├── Substrate::provision + wait_ready (retried)
//!                               └── Running | Failed
//! delete ──► Stopping ──► close sessions ──► teardown ──► Stopped ──► Deleted
//! reconcile ──► fail stuck Starting, fail vanished units, purge tombstones
//! ```

pub mod error;
pub mod namespaces;
pub mod orchestrator;
pub mod retry;

pub use error::{LifecycleError, LifecycleResult};
pub use namespaces::{DEFAULT_NAMESPACE, Namespaces};
pub use orchestrator::{
    CreateRequest, Orchestrator, ReconcileReport, SessionCloser, WorkloadStatus,
};
pub use retry::RetryPolicy;
