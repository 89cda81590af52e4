//! skiff-substrate: the compute backend seam.
//!
//! The control plane never runs workloads itself; it asks a [`Substrate`]
//! to provision, inspect, attach to, checkpoint, and tear down units
//! addressed by a [`SubstrateHandle`]. Two implementations ship:
//!
//! - [`LocalSubstrate`]: one directory per unit, processes via
//!   `tokio::process`. Enough to run the daemon on a single host.
//! - [`FakeSubstrate`]: in-memory and scriptable, for tests.

pub mod channel;
pub mod error;
pub mod fake;
pub mod local;
pub mod types;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

pub use channel::{CloseGuard, ProcessChannel};
pub use error::{SubstrateError, SubstrateResult};
pub use fake::FakeSubstrate;
pub use local::LocalSubstrate;
pub use skiff_core::SubstrateHandle;
pub use types::*;

#[async_trait]
pub trait Substrate: Send + Sync {
    /// Create the unit. Provisioning an existing handle again is a no-op.
    async fn provision(&self, handle: &SubstrateHandle, spec: &ProvisionSpec)
    -> SubstrateResult<()>;

    /// Resolve once the unit can accept sessions.
    async fn wait_ready(&self, handle: &SubstrateHandle) -> SubstrateResult<()>;

    /// Destroy the unit and every process in it. Unknown handles succeed.
    async fn teardown(&self, handle: &SubstrateHandle) -> SubstrateResult<()>;

    async fn inspect(&self, handle: &SubstrateHandle) -> SubstrateResult<UnitStatus>;

    async fn exec(
        &self,
        handle: &SubstrateHandle,
        request: ExecRequest,
    ) -> SubstrateResult<ProcessChannel>;

    /// Follow the unit's log. The receiver ends when the unit goes away.
    async fn logs(&self, handle: &SubstrateHandle) -> SubstrateResult<mpsc::Receiver<String>>;

    async fn metrics(&self, handle: &SubstrateHandle) -> SubstrateResult<MetricSample>;

    async fn checkpoint(
        &self,
        handle: &SubstrateHandle,
        snapshot_id: &str,
    ) -> SubstrateResult<CheckpointRef>;

    /// Remove stored checkpoint data. Unknown references succeed.
    async fn delete_checkpoint(&self, storage_ref: &str) -> SubstrateResult<()>;

    /// Write a file inside the unit; returns bytes written.
    async fn upload(&self, handle: &SubstrateHandle, path: &str, data: Bytes)
    -> SubstrateResult<u64>;

    async fn download(&self, handle: &SubstrateHandle, path: &str) -> SubstrateResult<Bytes>;
}
