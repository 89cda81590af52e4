//! Machine probe logic.
//!
//! Performs HTTP GETs against machine health endpoints and folds the
//! results into a [`MachineStatus`] with exponential backoff between
//! failing probes.

use std::time::Duration;

use tracing::{debug, warn};

use crate::aggregator::MachineStatus;

/// Result of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The health endpoint returned 2xx.
    Healthy,
    /// The health endpoint returned non-2xx.
    Unhealthy,
    /// The probe could not be executed (connection error or timeout).
    Failed,
}

/// Tracks consecutive probe results for a single machine.
#[derive(Debug)]
pub struct HealthTracker {
    status: MachineStatus,
    consecutive_failures: u32,
    /// Failures at which the machine is reported unreachable.
    unreachable_threshold: u32,
    current_backoff: Duration,
    base_interval: Duration,
    max_backoff: Duration,
}

impl HealthTracker {
    pub fn new(unreachable_threshold: u32, interval: Duration) -> Self {
        Self {
            status: MachineStatus::Healthy,
            consecutive_failures: 0,
            unreachable_threshold: unreachable_threshold.max(1),
            current_backoff: interval,
            base_interval: interval,
            max_backoff: Duration::from_secs(60).max(interval),
        }
    }

    /// Record a probe result and return the status to report.
    ///
    /// One success restores `Healthy`. Failures below the threshold read as
    /// `Degraded`, at or above it as `Unreachable`.
    pub fn record(&mut self, result: ProbeResult) -> MachineStatus {
        match result {
            ProbeResult::Healthy => {
                if self.status != MachineStatus::Healthy {
                    debug!(failures = self.consecutive_failures, "machine recovered");
                }
                self.consecutive_failures = 0;
                self.current_backoff = self.base_interval;
                self.status = MachineStatus::Healthy;
            }
            ProbeResult::Unhealthy | ProbeResult::Failed => {
                self.consecutive_failures += 1;

                // Exponential backoff: double the interval up to max.
                self.current_backoff = (self.current_backoff * 2).min(self.max_backoff);

                if self.consecutive_failures >= self.unreachable_threshold {
                    if self.status != MachineStatus::Unreachable {
                        warn!(
                            failures = self.consecutive_failures,
                            threshold = self.unreachable_threshold,
                            "machine marked unreachable"
                        );
                    }
                    self.status = MachineStatus::Unreachable;
                } else {
                    self.status = MachineStatus::Degraded;
                }
            }
        }

        self.status
    }

    pub fn status(&self) -> MachineStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Delay before the next probe.
    pub fn next_interval(&self) -> Duration {
        self.current_backoff
    }
}

/// Perform an HTTP health probe against `address` (`host:port`).
///
/// Returns `Healthy` if the response is 2xx, `Unhealthy` for non-2xx,
/// or `Failed` if the connection fails or times out.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", concat!("skiff-health/", env!("CARGO_PKG_VERSION")))
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "probe request invalid");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => ProbeResult::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "probe non-2xx");
                ProbeResult::Unhealthy
            }
            Err(e) => {
                debug!(error = %e, %uri, "probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%uri, "probe timed out");
            ProbeResult::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    fn tracker() -> HealthTracker {
        HealthTracker::new(3, Duration::from_secs(1))
    }

    #[test]
    fn tracker_starts_healthy() {
        let tracker = tracker();
        assert_eq!(tracker.status(), MachineStatus::Healthy);
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn failures_below_threshold_are_degraded() {
        let mut tracker = tracker();
        assert_eq!(tracker.record(ProbeResult::Unhealthy), MachineStatus::Degraded);
        assert_eq!(tracker.record(ProbeResult::Failed), MachineStatus::Degraded);
        assert_eq!(tracker.consecutive_failures(), 2);
    }

    #[test]
    fn threshold_reached_is_unreachable() {
        let mut tracker = tracker();
        for _ in 0..2 {
            tracker.record(ProbeResult::Failed);
        }
        assert_eq!(tracker.record(ProbeResult::Failed), MachineStatus::Unreachable);
    }

    #[test]
    fn single_success_recovers() {
        let mut tracker = tracker();
        for _ in 0..5 {
            tracker.record(ProbeResult::Failed);
        }
        assert_eq!(tracker.record(ProbeResult::Healthy), MachineStatus::Healthy);
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn backoff_doubles_caps_and_resets() {
        let mut tracker = HealthTracker::new(100, Duration::from_secs(1));
        tracker.record(ProbeResult::Failed);
        assert_eq!(tracker.next_interval(), Duration::from_secs(2));
        tracker.record(ProbeResult::Failed);
        assert_eq!(tracker.next_interval(), Duration::from_secs(4));

        for _ in 0..10 {
            tracker.record(ProbeResult::Failed);
        }
        assert_eq!(tracker.next_interval(), Duration::from_secs(60));

        tracker.record(ProbeResult::Healthy);
        assert_eq!(tracker.next_interval(), Duration::from_secs(1));
    }

    async fn serve_once(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!("{status_line}\r\ncontent-length: 0\r\n\r\n");
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn probe_reports_2xx_as_healthy() {
        let addr = serve_once("HTTP/1.1 200 OK").await;
        let result = http_probe(&addr, "/healthz", Duration::from_secs(2)).await;
        assert_eq!(result, ProbeResult::Healthy);
    }

    #[tokio::test]
    async fn probe_reports_5xx_as_unhealthy() {
        let addr = serve_once("HTTP/1.1 503 Service Unavailable").await;
        let result = http_probe(&addr, "/healthz", Duration::from_secs(2)).await;
        assert_eq!(result, ProbeResult::Unhealthy);
    }

    #[tokio::test]
    async fn probe_connection_refused_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let result = http_probe(&addr, "/healthz", Duration::from_secs(2)).await;
        assert_eq!(result, ProbeResult::Failed);
    }
}
