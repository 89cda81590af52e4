//! Opening sessions and pumping their I/O.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use skiff_auth::Principal;
use skiff_core::config::SessionConfig;
use skiff_lifecycle::Orchestrator;
use skiff_state::{Repository, WorkloadState};
use skiff_substrate::{ExecRequest, ProcessChannel, SubstrateHandle};

use crate::error::{SessionError, SessionResult};
use crate::frame::{CloseReason, SessionEvent, SessionKind, StreamEvent};
use crate::registry::{Registration, SessionId, SessionRegistry};

/// Client side of an exec or connect session.
///
/// Dropping `input` closes the process's stdin; dropping `events` ends the
/// session.
#[derive(Debug)]
pub struct InteractiveSession {
    pub id: SessionId,
    pub input: mpsc::Sender<Bytes>,
    pub events: mpsc::Receiver<SessionEvent>,
}

/// Client side of a log or metric stream.
#[derive(Debug)]
pub struct StreamSession {
    pub id: SessionId,
    pub events: mpsc::Receiver<StreamEvent>,
}

/// Result of a buffered exec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecOutput {
    pub output: String,
    pub exit_code: Option<i32>,
}

pub struct SessionManager {
    orchestrator: Arc<Orchestrator>,
    registry: Arc<SessionRegistry>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(orchestrator: Arc<Orchestrator>, config: SessionConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.close_grace));
        orchestrator.attach_sessions(registry.clone());
        Self {
            orchestrator,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// The workload's handle, registered as a session of `kind`.
    fn begin(
        &self,
        principal: &Principal,
        workload_id: &str,
        kind: SessionKind,
    ) -> SessionResult<(SubstrateHandle, Registration)> {
        let (_, handle) = self.orchestrator.running(principal, workload_id)?;
        let registration = self.registry.register(workload_id, kind);
        Ok((handle, registration))
    }

    /// Re-check after the substrate call: a delete that moved the workload
    /// out of Running before this point may have already closed sessions.
    fn confirm(&self, workload_id: &str) -> SessionResult<()> {
        let workload = self.orchestrator.repo().get_workload(workload_id)?;
        if workload.state == WorkloadState::Running {
            Ok(())
        } else {
            Err(SessionError::WorkloadUnavailable(workload_id.to_string()))
        }
    }

    pub async fn open_exec(
        &self,
        principal: &Principal,
        workload_id: &str,
        request: ExecRequest,
    ) -> SessionResult<InteractiveSession> {
        self.open_interactive(principal, workload_id, SessionKind::Exec, request)
            .await
    }

    /// Attach to the workload's configured interactive command.
    pub async fn open_connect(
        &self,
        principal: &Principal,
        workload_id: &str,
    ) -> SessionResult<InteractiveSession> {
        let request = ExecRequest::new(self.config.connect_command.clone());
        self.open_interactive(principal, workload_id, SessionKind::Connect, request)
            .await
    }

    async fn open_interactive(
        &self,
        principal: &Principal,
        workload_id: &str,
        kind: SessionKind,
        request: ExecRequest,
    ) -> SessionResult<InteractiveSession> {
        let (handle, registration) = self.begin(principal, workload_id, kind)?;
        let channel = self.orchestrator.substrate().exec(&handle, request).await?;
        self.confirm(workload_id)?;

        let buffer = self.config.interactive_buffer.max(1);
        let (input_tx, input_rx) = mpsc::channel(buffer);
        let (events_tx, events_rx) = mpsc::channel(buffer);
        let id = registration.id().to_string();
        info!(session_id = %id, %workload_id, kind = kind.as_str(), "session opened");
        tokio::spawn(pump_interactive(
            channel,
            input_rx,
            events_tx,
            registration,
            self.registry.close_grace(),
        ));
        Ok(InteractiveSession {
            id,
            input: input_tx,
            events: events_rx,
        })
    }

    /// Run a command to completion, collecting its output.
    pub async fn exec_collect(
        &self,
        principal: &Principal,
        workload_id: &str,
        request: ExecRequest,
    ) -> SessionResult<ExecOutput> {
        let InteractiveSession {
            input, mut events, ..
        } = self.open_exec(principal, workload_id, request).await?;
        drop(input);

        let mut output = Vec::new();
        let mut exit_code = None;
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Output(chunk) => output.extend_from_slice(&chunk),
                SessionEvent::Exit(code) => exit_code = Some(code),
                SessionEvent::Closed(CloseReason::WorkloadUnavailable) => {
                    return Err(SessionError::WorkloadUnavailable(workload_id.to_string()));
                }
                SessionEvent::Closed(_) => break,
            }
        }
        Ok(ExecOutput {
            output: String::from_utf8_lossy(&output).into_owned(),
            exit_code,
        })
    }

    pub async fn open_logs(
        &self,
        principal: &Principal,
        workload_id: &str,
    ) -> SessionResult<StreamSession> {
        let (handle, registration) = self.begin(principal, workload_id, SessionKind::LogStream)?;
        let lines = self.orchestrator.substrate().logs(&handle).await?;
        self.confirm(workload_id)?;
        Ok(self.start_stream(lines, registration))
    }

    pub async fn open_metrics(
        &self,
        principal: &Principal,
        workload_id: &str,
    ) -> SessionResult<StreamSession> {
        let (handle, registration) =
            self.begin(principal, workload_id, SessionKind::MetricStream)?;
        let first = self.orchestrator.substrate().metrics(&handle).await?;
        self.confirm(workload_id)?;

        let (tx, rx) = mpsc::channel(1);
        let substrate = self.orchestrator.substrate().clone();
        let every = self.config.metrics_interval;
        tokio::spawn(async move {
            if tx.send(first).await.is_err() {
                return;
            }
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match substrate.metrics(&handle).await {
                    Ok(sample) => {
                        if tx.send(sample).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        debug!(%handle, error = %e, "metric sampling stopped");
                        return;
                    }
                }
            }
        });
        Ok(self.start_stream(rx, registration))
    }

    fn start_stream<T>(&self, source: mpsc::Receiver<T>, registration: Registration) -> StreamSession
    where
        T: Serialize + Send + 'static,
    {
        let buffer = self.config.stream_buffer.max(1);
        let (events_tx, events_rx) = mpsc::channel(buffer);
        let id = registration.id().to_string();
        info!(session_id = %id, "stream opened");
        tokio::spawn(pump_stream(
            source,
            events_tx,
            registration,
            buffer,
            self.registry.close_grace(),
        ));
        StreamSession {
            id,
            events: events_rx,
        }
    }
}

/// Shuttle bytes both ways until the process exits, the client leaves, or
/// the session is told to close. Each direction waits on its own consumer.
async fn pump_interactive(
    channel: ProcessChannel,
    mut client_input: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<SessionEvent>,
    mut registration: Registration,
    grace: Duration,
) {
    let ProcessChannel {
        input,
        mut output,
        mut exit,
        guard,
    } = channel;

    let input_pump = tokio::spawn(async move {
        while let Some(chunk) = client_input.recv().await {
            if input.send(chunk).await.is_err() {
                break;
            }
        }
    });

    let reason = loop {
        tokio::select! {
            reason = registration.signalled() => break reason,
            _ = events.closed() => break CloseReason::ClientGone,
            chunk = output.recv() => match chunk {
                Some(chunk) => {
                    tokio::select! {
                        sent = events.send(SessionEvent::Output(chunk)) => {
                            if sent.is_err() {
                                break CloseReason::ClientGone;
                            }
                        }
                        reason = registration.signalled() => break reason,
                    }
                }
                None => {
                    let code = tokio::select! {
                        code = &mut exit => code.unwrap_or(-1),
                        reason = registration.signalled() => break reason,
                    };
                    if events.send(SessionEvent::Exit(code)).await.is_err() {
                        break CloseReason::ClientGone;
                    }
                    break CloseReason::Completed;
                }
            },
        }
    };

    input_pump.abort();
    guard.close();
    drop(output);
    debug!(session_id = %registration.id(), ?reason, "session closing");
    let _ = tokio::time::timeout(grace, events.send(SessionEvent::Closed(reason))).await;
    drop(registration);
}

/// Number entries from `source` and deliver them best-effort: a ring of
/// `buffer` entries sits between producer and consumer, and when the
/// consumer falls behind the oldest are overwritten and reported as a gap.
async fn pump_stream<T>(
    mut source: mpsc::Receiver<T>,
    events: mpsc::Sender<StreamEvent>,
    mut registration: Registration,
    buffer: usize,
    grace: Duration,
) where
    T: Serialize + Send + 'static,
{
    let (ring, mut ring_rx) = broadcast::channel::<(u64, serde_json::Value)>(buffer);
    let producer = tokio::spawn(async move {
        let mut seq = 0u64;
        while let Some(item) = source.recv().await {
            let data = match serde_json::to_value(&item) {
                Ok(data) => data,
                Err(e) => {
                    debug!(error = %e, "unserializable stream entry skipped");
                    continue;
                }
            };
            seq += 1;
            if ring.send((seq, data)).is_err() {
                return;
            }
        }
    });

    let mut last = 0u64;
    let reason = loop {
        let event = tokio::select! {
            reason = registration.signalled() => break reason,
            _ = events.closed() => break CloseReason::ClientGone,
            item = ring_rx.recv() => match item {
                Ok((seq, data)) => {
                    last = seq;
                    StreamEvent::Entry { seq, data }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    StreamEvent::Gap { after: last, missed }
                }
                Err(broadcast::error::RecvError::Closed) => break CloseReason::Completed,
            },
        };
        if let StreamEvent::Gap { missed, .. } = event {
            last += missed;
        }
        tokio::select! {
            sent = events.send(event) => {
                if sent.is_err() {
                    break CloseReason::ClientGone;
                }
            }
            reason = registration.signalled() => break reason,
        }
    };

    producer.abort();
    debug!(session_id = %registration.id(), ?reason, "stream closing");
    let _ = tokio::time::timeout(grace, events.send(StreamEvent::Closed { reason })).await;
    drop(registration);
}
