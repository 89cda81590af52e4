//! Identifier newtypes shared across crate boundaries.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque reference to a unit on the substrate.
///
/// Derived from the workload id so that whoever holds the workload record can
/// always address (and tear down) whatever provisioning created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubstrateHandle(String);

impl SubstrateHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Handle for a workload: `{prefix}-{workload_id}`.
    pub fn for_workload(prefix: &str, workload_id: &str) -> Self {
        Self(format!("{prefix}-{workload_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubstrateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_from_workload_id() {
        let handle = SubstrateHandle::for_workload("skiff", "w-123");
        assert_eq!(handle.as_str(), "skiff-w-123");
        assert_eq!(serde_json::to_string(&handle).unwrap(), "\"skiff-w-123\"");
    }
}
