//! Resource vocabulary shared by workloads, namespaces, and quotas.

use serde::{Deserialize, Serialize};

/// Declared resource request of a workload (or an aggregate of several).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// CPU in millicores.
    #[serde(default)]
    pub cpu_millis: u64,
    /// Memory in mebibytes.
    #[serde(default)]
    pub memory_mb: u64,
    /// Whole GPU units.
    #[serde(default)]
    pub gpus: u32,
}

impl ResourceRequest {
    pub const fn new(cpu_millis: u64, memory_mb: u64, gpus: u32) -> Self {
        Self {
            cpu_millis,
            memory_mb,
            gpus,
        }
    }

    /// True when no dimension is requested.
    pub fn is_empty(&self) -> bool {
        self.cpu_millis == 0 && self.memory_mb == 0 && self.gpus == 0
    }

    pub fn saturating_add(self, other: Self) -> Self {
        Self {
            cpu_millis: self.cpu_millis.saturating_add(other.cpu_millis),
            memory_mb: self.memory_mb.saturating_add(other.memory_mb),
            gpus: self.gpus.saturating_add(other.gpus),
        }
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        Self {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            gpus: self.gpus.saturating_sub(other.gpus),
        }
    }

    /// True if every dimension of `self` is within `limit`.
    pub fn fits_within(&self, limit: &Self) -> bool {
        self.cpu_millis <= limit.cpu_millis
            && self.memory_mb <= limit.memory_mb
            && self.gpus <= limit.gpus
    }
}

/// Ceiling on concurrently held resources for one quota subject.
///
/// A `None` dimension is unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ceiling {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workloads: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu_millis: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_gpus: Option<u32>,
}

impl Ceiling {
    /// A ceiling that limits only the workload count.
    pub const fn workloads(max: u32) -> Self {
        Self {
            max_workloads: Some(max),
            max_cpu_millis: None,
            max_memory_mb: None,
            max_gpus: None,
        }
    }

    /// Name of the first dimension that `workloads`/`usage` would exceed.
    pub fn first_exceeded(&self, workloads: u32, usage: &ResourceRequest) -> Option<&'static str> {
        if self.max_workloads.is_some_and(|max| workloads > max) {
            return Some("workloads");
        }
        if self.max_cpu_millis.is_some_and(|max| usage.cpu_millis > max) {
            return Some("cpu");
        }
        if self.max_memory_mb.is_some_and(|max| usage.memory_mb > max) {
            return Some("memory");
        }
        if self.max_gpus.is_some_and(|max| usage.gpus > max) {
            return Some("gpu");
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_saturates() {
        let a = ResourceRequest::new(500, 256, 0);
        let b = ResourceRequest::new(1000, 128, 1);
        assert_eq!(a.saturating_add(b), ResourceRequest::new(1500, 384, 1));
        assert_eq!(a.saturating_sub(b), ResourceRequest::new(0, 128, 0));
    }

    #[test]
    fn fits_within_checks_every_dimension() {
        let limit = ResourceRequest::new(1000, 512, 1);
        assert!(ResourceRequest::new(1000, 512, 1).fits_within(&limit));
        assert!(!ResourceRequest::new(1001, 1, 0).fits_within(&limit));
        assert!(!ResourceRequest::new(1, 1, 2).fits_within(&limit));
    }

    #[test]
    fn ceiling_reports_first_exceeded_dimension() {
        let ceiling = Ceiling {
            max_workloads: Some(2),
            max_cpu_millis: Some(1000),
            max_memory_mb: None,
            max_gpus: Some(0),
        };
        assert_eq!(ceiling.first_exceeded(2, &ResourceRequest::new(1000, 1 << 20, 0)), None);
        assert_eq!(ceiling.first_exceeded(3, &ResourceRequest::default()), Some("workloads"));
        assert_eq!(ceiling.first_exceeded(1, &ResourceRequest::new(1001, 0, 0)), Some("cpu"));
        assert_eq!(ceiling.first_exceeded(1, &ResourceRequest::new(0, 0, 1)), Some("gpu"));
        assert_eq!(Ceiling::workloads(1).first_exceeded(1, &ResourceRequest::new(9999, 9999, 9)), None);
    }

    #[test]
    fn missing_fields_default_to_zero() {
        let req: ResourceRequest = serde_json::from_str(r#"{"memory_mb": 64}"#).unwrap();
        assert_eq!(req, ResourceRequest::new(0, 64, 0));
        assert!(!req.is_empty());
        assert!(ResourceRequest::default().is_empty());
    }
}
