//! Domain types for the Skiff repository.
//!
//! These types represent the persisted state of workloads, namespaces,
//! secrets, and snapshots. All types are serializable to/from JSON for
//! storage in redb tables.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use skiff_core::{Ceiling, ResourceRequest, SubstrateHandle};

use crate::error::{StateError, StateResult};

/// Unique identifier for a workload.
pub type WorkloadId = String;

/// Identity of an authenticated principal (the API key id).
pub type PrincipalId = String;

/// Unique identifier for a snapshot.
pub type SnapshotId = String;

// ── Workload ──────────────────────────────────────────────────────

/// Lifecycle state of a workload.
///
/// ```text
/// Pending → Starting → Running → Stopping → Stopped → Deleted
///    │         │ │        │         │
///    │         │ └────────┴─────────┴──→ Failed → Deleted
///    └─────────┴──────────────────────────────────→ Deleted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadState {
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Deleted,
}

impl WorkloadState {
    pub const ALL: [WorkloadState; 7] = [
        WorkloadState::Pending,
        WorkloadState::Starting,
        WorkloadState::Running,
        WorkloadState::Stopping,
        WorkloadState::Stopped,
        WorkloadState::Failed,
        WorkloadState::Deleted,
    ];

    /// Whether a workload in this state carries a substrate handle.
    pub fn holds_handle(self) -> bool {
        matches!(
            self,
            WorkloadState::Starting | WorkloadState::Running | WorkloadState::Stopping
        )
    }

    pub fn is_terminal(self) -> bool {
        self == WorkloadState::Deleted
    }

    /// Whether a workload in this state still holds a quota reservation.
    pub fn holds_reservation(self) -> bool {
        !matches!(self, WorkloadState::Failed | WorkloadState::Deleted)
    }

    pub fn can_transition_to(self, next: WorkloadState) -> bool {
        use WorkloadState::*;
        matches!(
            (self, next),
            (Pending, Starting)
                | (Pending, Deleted)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Starting, Failed)
                | (Starting, Deleted)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
                | (Stopping, Failed)
                | (Stopped, Deleted)
                | (Failed, Deleted)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkloadState::Pending => "pending",
            WorkloadState::Starting => "starting",
            WorkloadState::Running => "running",
            WorkloadState::Stopping => "stopping",
            WorkloadState::Stopped => "stopped",
            WorkloadState::Failed => "failed",
            WorkloadState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for WorkloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller asked to run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Namespace secret keys injected as environment variables.
    #[serde(default)]
    pub secrets: Vec<String>,
    /// Template the spec was expanded from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// Snapshot a workload was restored from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreSeed {
    pub snapshot_id: SnapshotId,
    pub storage_ref: String,
}

/// A provisioned compute unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub id: WorkloadId,
    pub namespace: String,
    pub owner: PrincipalId,
    pub spec: WorkloadSpec,
    pub resources: ResourceRequest,
    pub state: WorkloadState,
    /// Set iff `state.holds_handle()`.
    pub handle: Option<SubstrateHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_from: Option<RestoreSeed>,
    /// Unix timestamp (seconds) when the workload was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last state transition.
    pub updated_at: u64,
}

impl Workload {
    /// Apply a transition in place, enforcing the state machine and the
    /// handle invariant.
    pub fn apply(&mut self, transition: Transition, now: u64) -> StateResult<()> {
        if !self.state.can_transition_to(transition.to) {
            return Err(StateError::InvalidTransition {
                id: self.id.clone(),
                from: self.state,
                to: transition.to,
            });
        }
        let handle = if transition.to.holds_handle() {
            match transition.handle.or_else(|| self.handle.take()) {
                Some(h) => Some(h),
                None => {
                    return Err(StateError::InvalidTransition {
                        id: self.id.clone(),
                        from: self.state,
                        to: transition.to,
                    });
                }
            }
        } else {
            None
        };
        if transition.to == WorkloadState::Failed {
            self.failure = transition.reason;
        }
        self.state = transition.to;
        self.handle = handle;
        self.updated_at = now;
        Ok(())
    }
}

/// A requested state change, applied by compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub to: WorkloadState,
    /// Handle to record; `None` keeps the current one when the target state
    /// holds a handle.
    pub handle: Option<SubstrateHandle>,
    /// Failure reason, recorded when entering `Failed`.
    pub reason: Option<String>,
}

impl Transition {
    pub fn to(state: WorkloadState) -> Self {
        Self {
            to: state,
            handle: None,
            reason: None,
        }
    }

    pub fn with_handle(mut self, handle: SubstrateHandle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Selection criteria for listing workloads.
#[derive(Debug, Clone, Default)]
pub struct WorkloadFilter {
    pub namespace: Option<String>,
    pub owner: Option<PrincipalId>,
    pub state: Option<WorkloadState>,
    /// Include `Deleted` tombstones.
    pub include_deleted: bool,
}

impl WorkloadFilter {
    pub fn matches(&self, workload: &Workload) -> bool {
        if !self.include_deleted
            && workload.state == WorkloadState::Deleted
            && self.state != Some(WorkloadState::Deleted)
        {
            return false;
        }
        self.namespace.as_ref().is_none_or(|ns| *ns == workload.namespace)
            && self.owner.as_ref().is_none_or(|o| *o == workload.owner)
            && self.state.is_none_or(|s| s == workload.state)
    }
}

// ── Namespace ─────────────────────────────────────────────────────

/// Default resource policy applied to workloads in a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourcePolicy {
    /// Request given to workloads that do not declare one.
    #[serde(default)]
    pub default_request: Option<ResourceRequest>,
    /// Largest request a single workload may declare.
    #[serde(default)]
    pub max_per_workload: Option<ResourceRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
    pub owner: PrincipalId,
    #[serde(default)]
    pub policy: ResourcePolicy,
    pub created_at: u64,
}

// ── Secret ────────────────────────────────────────────────────────

/// Sealed credential material. The payload never leaves the control plane
/// except towards the substrate at provisioning time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    pub namespace: String,
    pub key: String,
    /// Nonce-prefixed AES-256-GCM ciphertext.
    pub sealed: Vec<u8>,
    pub version: u64,
    pub updated_at: u64,
}

/// Client-visible view of a secret (no payload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretInfo {
    pub namespace: String,
    pub key: String,
    pub version: u64,
    pub updated_at: u64,
}

impl Secret {
    pub fn table_key(&self) -> String {
        secret_key(&self.namespace, &self.key)
    }

    pub fn info(&self) -> SecretInfo {
        SecretInfo {
            namespace: self.namespace.clone(),
            key: self.key.clone(),
            version: self.version,
            updated_at: self.updated_at,
        }
    }
}

/// Composite key for the secrets table: `{namespace}/{key}`.
pub fn secret_key(namespace: &str, key: &str) -> String {
    format!("{namespace}/{key}")
}

// ── Snapshot ──────────────────────────────────────────────────────

/// Immutable checkpoint of a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub workload_id: WorkloadId,
    pub namespace: String,
    pub owner: PrincipalId,
    /// Where the substrate stored the checkpoint.
    pub storage_ref: String,
    pub size_bytes: u64,
    pub created_at: u64,
}

// ── API keys and ceilings ─────────────────────────────────────────

/// An issued API key as persisted. Only the SHA-256 digest of the key
/// material is kept; scopes are stored by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredApiKey {
    pub id: PrincipalId,
    pub label: String,
    pub scopes: Vec<String>,
    /// Hex-encoded SHA-256 of the key material.
    pub digest: String,
    pub created_at: u64,
}

/// An explicit quota ceiling set at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCeiling {
    /// `principal` or `namespace`.
    pub kind: String,
    pub id: String,
    pub ceiling: Ceiling,
}

impl StoredCeiling {
    pub fn table_key(&self) -> String {
        ceiling_key(&self.kind, &self.id)
    }
}

/// Table key of a ceiling record: `{kind}/{id}`.
pub fn ceiling_key(kind: &str, id: &str) -> String {
    format!("{kind}/{id}")
}
