//! Probe monitor: background tasks that probe configured machines and
//! feed the aggregator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use skiff_core::config::{HealthConfig, ProbeTarget};

use crate::aggregator::HealthAggregator;
use crate::checker::{HealthTracker, http_probe};

/// Per-machine monitor state.
struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

pub struct ProbeMonitor {
    aggregator: Arc<HealthAggregator>,
    interval: Duration,
    timeout: Duration,
    unreachable_threshold: u32,
    /// Active monitors: machine_id → slot.
    monitors: Arc<RwLock<HashMap<String, MonitorSlot>>>,
}

impl ProbeMonitor {
    pub fn new(aggregator: Arc<HealthAggregator>, config: &HealthConfig) -> Self {
        Self {
            aggregator,
            interval: config.probe_interval,
            timeout: config.probe_timeout,
            unreachable_threshold: config.unreachable_threshold,
            monitors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start probing a machine, replacing any existing monitor for it.
    pub async fn start_monitor(&self, target: &ProbeTarget) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let target_owned = target.clone();
        let aggregator = self.aggregator.clone();
        let tracker = HealthTracker::new(self.unreachable_threshold, self.interval);
        let timeout = self.timeout;

        let handle = tokio::spawn(async move {
            run_probe_loop(&target_owned, aggregator, tracker, timeout, shutdown_rx).await;
        });

        let mut monitors = self.monitors.write().await;
        if let Some(old) = monitors.insert(
            target.machine_id.clone(),
            MonitorSlot {
                handle,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }

        info!(machine_id = %target.machine_id, address = %target.address, "probe monitor started");
    }

    pub async fn stop_monitor(&self, machine_id: &str) {
        let mut monitors = self.monitors.write().await;
        if let Some(slot) = monitors.remove(machine_id) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(%machine_id, "probe monitor stopped");
        }
    }

    /// Stop all monitors (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        for (id, slot) in monitors.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(machine_id = %id, "probe monitor stopped");
        }
    }

    pub async fn active_monitors(&self) -> Vec<String> {
        let monitors = self.monitors.read().await;
        let mut ids: Vec<_> = monitors.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Probe loop for a single machine. Every probe produces a report, so a
/// probed machine never goes stale while its monitor runs.
async fn run_probe_loop(
    target: &ProbeTarget,
    aggregator: Arc<HealthAggregator>,
    mut tracker: HealthTracker,
    timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(machine_id = %target.machine_id, "probe loop starting");

    loop {
        let result = http_probe(&target.address, &target.path, timeout).await;
        let status = tracker.record(result);
        aggregator.report(&target.machine_id, status);

        tokio::select! {
            _ = tokio::time::sleep(tracker.next_interval()) => {}
            _ = shutdown.changed() => {
                debug!(machine_id = %target.machine_id, "probe loop shutting down");
                break;
            }
        }
    }
}
