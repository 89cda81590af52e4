//! Last-report-wins machine health registry.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use skiff_core::epoch_secs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    Healthy,
    Degraded,
    Unreachable,
}

impl MachineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MachineStatus::Healthy => "healthy",
            MachineStatus::Degraded => "degraded",
            MachineStatus::Unreachable => "unreachable",
        }
    }
}

/// Health of one machine as seen by readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MachineHealth {
    pub machine_id: String,
    pub status: MachineStatus,
    /// Unix timestamp (seconds) of the last report.
    pub last_seen: u64,
    /// True when `status` was forced to `Unreachable` by staleness.
    pub stale: bool,
}

struct Entry {
    status: MachineStatus,
    reported_at: Instant,
    last_seen: u64,
}

pub struct HealthAggregator {
    entries: RwLock<HashMap<String, Entry>>,
    staleness_window: Duration,
}

impl HealthAggregator {
    pub fn new(staleness_window: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            staleness_window,
        }
    }

    /// Record a report, replacing whatever was known about the machine.
    pub fn report(&self, machine_id: &str, status: MachineStatus) -> MachineHealth {
        let entry = Entry {
            status,
            reported_at: Instant::now(),
            last_seen: epoch_secs(),
        };
        let health = MachineHealth {
            machine_id: machine_id.to_string(),
            status,
            last_seen: entry.last_seen,
            stale: false,
        };
        let previous = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(machine_id.to_string(), entry);
        if previous.is_none_or(|p| p.status != status) {
            debug!(%machine_id, status = status.as_str(), "machine health changed");
        }
        health
    }

    pub fn get(&self, machine_id: &str) -> Option<MachineHealth> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(machine_id)
            .map(|entry| self.view(machine_id, entry, Instant::now()))
    }

    pub fn list(&self) -> Vec<MachineHealth> {
        let now = Instant::now();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = entries
            .iter()
            .map(|(id, entry)| self.view(id, entry, now))
            .collect();
        all.sort_by(|a, b| a.machine_id.cmp(&b.machine_id));
        all
    }

    /// Machines currently not `Healthy`; handed to the substrate as
    /// placement hints.
    pub fn avoid_list(&self) -> Vec<String> {
        self.list()
            .into_iter()
            .filter(|m| m.status != MachineStatus::Healthy)
            .map(|m| m.machine_id)
            .collect()
    }

    fn view(&self, machine_id: &str, entry: &Entry, now: Instant) -> MachineHealth {
        let stale = now.saturating_duration_since(entry.reported_at) > self.staleness_window;
        MachineHealth {
            machine_id: machine_id.to_string(),
            status: if stale {
                MachineStatus::Unreachable
            } else {
                entry.status
            },
            last_seen: entry.last_seen,
            stale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn report_then_get() {
        let agg = HealthAggregator::new(Duration::from_secs(60));
        agg.report("m-1", MachineStatus::Healthy);
        let health = agg.get("m-1").unwrap();
        assert_eq!(health.status, MachineStatus::Healthy);
        assert!(!health.stale);
        assert!(agg.get("m-2").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn later_report_supersedes() {
        let agg = HealthAggregator::new(Duration::from_secs(60));
        agg.report("m-1", MachineStatus::Healthy);
        agg.report("m-1", MachineStatus::Degraded);
        assert_eq!(agg.get("m-1").unwrap().status, MachineStatus::Degraded);
        assert_eq!(agg.list().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_machine_becomes_unreachable() {
        let agg = HealthAggregator::new(Duration::from_secs(60));
        agg.report("m-1", MachineStatus::Healthy);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(agg.get("m-1").unwrap().status, MachineStatus::Healthy);

        tokio::time::advance(Duration::from_secs(2)).await;
        let health = agg.get("m-1").unwrap();
        assert_eq!(health.status, MachineStatus::Unreachable);
        assert!(health.stale);

        agg.report("m-1", MachineStatus::Healthy);
        assert_eq!(agg.get("m-1").unwrap().status, MachineStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn avoid_list_holds_unhealthy_machines() {
        let agg = HealthAggregator::new(Duration::from_secs(60));
        agg.report("a", MachineStatus::Healthy);
        agg.report("b", MachineStatus::Degraded);
        agg.report("c", MachineStatus::Unreachable);
        assert_eq!(agg.avoid_list(), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&MachineStatus::Unreachable).unwrap();
        assert_eq!(json, "\"unreachable\"");
    }
}
