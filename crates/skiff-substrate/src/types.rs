//! Values exchanged with the substrate.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use skiff_core::ResourceRequest;

/// Everything the substrate needs to bring a unit up.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProvisionSpec {
    pub workload_id: String,
    pub namespace: String,
    pub image: String,
    pub command: Vec<String>,
    /// Plain env merged with decrypted secrets.
    pub env: HashMap<String, String>,
    pub resources: ResourceRequest,
    /// Checkpoint to seed the unit's filesystem from.
    pub seed: Option<CheckpointRef>,
    /// Machines the substrate should avoid placing the unit on.
    pub avoid: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitPhase {
    Provisioning,
    Running,
    Exited,
}

/// What the substrate reports about one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStatus {
    pub phase: UnitPhase,
    pub ready: bool,
    pub machine_id: Option<String>,
}

/// A process to start inside a unit.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ExecRequest {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            env: HashMap::new(),
        }
    }
}

/// Point-in-time resource sample of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetricSample {
    pub cpu_millis: u64,
    pub memory_mb: u64,
    pub disk_bytes: u64,
    pub uptime_secs: u64,
    /// Unix timestamp (seconds).
    pub sampled_at: u64,
}

/// Where a checkpoint landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRef {
    pub storage_ref: String,
    pub size_bytes: u64,
}
