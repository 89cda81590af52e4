//! skiff-health: consolidated machine health.
//!
//! Collectors push reports with [`HealthAggregator::report`]; the daemon can
//! also probe configured machines itself through [`ProbeMonitor`]. Reports
//! supersede each other and go stale lazily: a machine silent for longer
//! than the staleness window reads as `Unreachable` without any sweeper.
//!
//! # Architecture
//!
//! ```text
//! ProbeMonitor
//!   └── Per-machine background task
//!       ├── HealthTracker (consecutive failures, backoff)
//!       ├── http_probe() → ProbeResult
//!       └── HealthAggregator::report()
//! ```

pub mod aggregator;
pub mod checker;
pub mod monitor;

pub use aggregator::{HealthAggregator, MachineHealth, MachineStatus};
pub use checker::{HealthTracker, ProbeResult, http_probe};
pub use monitor::ProbeMonitor;
