//! Events delivered to session clients.

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

use skiff_core::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Exec,
    Connect,
    LogStream,
    MetricStream,
}

impl SessionKind {
    pub const ALL: [SessionKind; 4] = [
        SessionKind::Exec,
        SessionKind::Connect,
        SessionKind::LogStream,
        SessionKind::MetricStream,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Exec => "exec",
            SessionKind::Connect => "connect",
            SessionKind::LogStream => "log_stream",
            SessionKind::MetricStream => "metric_stream",
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The process exited or the source ran dry.
    Completed,
    /// The client went away.
    ClientGone,
    /// The workload left Running.
    WorkloadUnavailable,
    /// The daemon is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Error kind reported to the client, if the close is an error.
    pub fn kind(self) -> Option<ErrorKind> {
        match self {
            CloseReason::WorkloadUnavailable => Some(ErrorKind::WorkloadUnavailable),
            _ => None,
        }
    }
}

/// Event on an exec/connect session, in process output order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Output(Bytes),
    Exit(i32),
    Closed(CloseReason),
}

/// Event on a log or metric stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Entry { seq: u64, data: Value },
    /// `missed` entries after `after` were dropped because the consumer
    /// fell behind.
    Gap { after: u64, missed: u64 },
    Closed { reason: CloseReason },
}
