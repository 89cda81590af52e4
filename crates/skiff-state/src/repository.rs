//! The persistence seam used by every stateful component.

use crate::error::StateResult;
use crate::types::*;

/// Durable record of workloads, namespaces, secrets, snapshots, issued
/// API keys, and explicit quota ceilings.
///
/// Implementations must make [`Repository::update_state`] atomic: the
/// expected-state check and the write happen as one step.
pub trait Repository: Send + Sync {
    // ── Workloads ──────────────────────────────────────────────────

    /// Insert a new workload. Fails with `AlreadyExists` on id collision.
    fn create_workload(&self, workload: &Workload) -> StateResult<()>;

    fn get_workload(&self, id: &str) -> StateResult<Workload>;

    fn list_workloads(&self, filter: &WorkloadFilter) -> StateResult<Vec<Workload>>;

    /// Move a workload from `expected` to `transition.to`.
    ///
    /// Fails with `Conflict` if the workload is not currently in `expected`
    /// and with `InvalidTransition` if the move is not allowed.
    fn update_state(
        &self,
        id: &str,
        expected: WorkloadState,
        transition: Transition,
    ) -> StateResult<Workload>;

    /// Remove a workload record outright (tombstone purge).
    fn purge_workload(&self, id: &str) -> StateResult<bool>;

    // ── Namespaces ─────────────────────────────────────────────────

    /// Insert a namespace. Fails with `AlreadyExists` if the name is taken.
    fn create_namespace(&self, namespace: &Namespace) -> StateResult<()>;

    /// Insert `namespace` unless one with the same name exists; return the
    /// stored record either way.
    fn ensure_namespace(&self, namespace: &Namespace) -> StateResult<Namespace>;

    fn get_namespace(&self, name: &str) -> StateResult<Namespace>;

    fn list_namespaces(&self) -> StateResult<Vec<Namespace>>;

    /// Replace the default resource policy of a namespace.
    fn set_namespace_policy(&self, name: &str, policy: ResourcePolicy) -> StateResult<Namespace>;

    /// Remove a namespace and its secrets. Fails with `NotEmpty` while any
    /// non-deleted workload lives in it.
    fn delete_namespace(&self, name: &str) -> StateResult<()>;

    // ── Secrets ────────────────────────────────────────────────────

    /// Store sealed material under `{namespace}/{key}`, bumping the version.
    fn put_secret(&self, namespace: &str, key: &str, sealed: Vec<u8>) -> StateResult<SecretInfo>;

    fn get_secret(&self, namespace: &str, key: &str) -> StateResult<Secret>;

    fn list_secrets(&self, namespace: &str) -> StateResult<Vec<SecretInfo>>;

    fn delete_secret(&self, namespace: &str, key: &str) -> StateResult<()>;

    // ── Snapshots ──────────────────────────────────────────────────

    /// Insert a snapshot record. Records are immutable once written.
    fn create_snapshot(&self, snapshot: &Snapshot) -> StateResult<()>;

    fn get_snapshot(&self, id: &str) -> StateResult<Snapshot>;

    /// Snapshots of one workload, oldest first.
    fn list_snapshots(&self, workload_id: &str) -> StateResult<Vec<Snapshot>>;

    fn delete_snapshot(&self, id: &str) -> StateResult<()>;

    // ── API keys ───────────────────────────────────────────────────

    /// Insert an issued key. Fails with `AlreadyExists` on id collision.
    fn create_api_key(&self, key: &StoredApiKey) -> StateResult<()>;

    fn list_api_keys(&self) -> StateResult<Vec<StoredApiKey>>;

    fn delete_api_key(&self, id: &str) -> StateResult<()>;

    // ── Quota ceilings ─────────────────────────────────────────────

    /// Insert or replace the ceiling for one subject.
    fn put_ceiling(&self, ceiling: &StoredCeiling) -> StateResult<()>;

    fn list_ceilings(&self) -> StateResult<Vec<StoredCeiling>>;

    /// Returns false if no ceiling was stored for the subject.
    fn delete_ceiling(&self, kind: &str, id: &str) -> StateResult<bool>;

    // ── Maintenance ────────────────────────────────────────────────

    /// Cheap liveness check of the backing store.
    fn health_check(&self) -> StateResult<()>;
}
