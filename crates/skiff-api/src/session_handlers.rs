//! Session endpoints: exec and connect over WebSocket, buffered exec, log and
//! metric streams over Server-Sent Events, and point-in-time metrics.

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::stream::{self, Stream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;

use skiff_auth::{Principal, Scope};
use skiff_session::{InteractiveSession, SessionEvent, StreamEvent, StreamSession};
use skiff_substrate::ExecRequest;

use crate::ApiState;
use crate::error::{ApiError, ApiResult};
use crate::extract::{Json, Query};
use crate::handlers::IdQuery;
use crate::prometheus::{self, ControlPlaneSnapshot, render_prometheus};
use crate::response::ApiResponse;

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
pub struct ExecBody {
    pub id: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MetricsQuery {
    pub id: Option<String>,
}

/// `id` and the ordered `command` values of `/exec?id=..&command=..&command=..`.
fn exec_target(pairs: Vec<(String, String)>) -> ApiResult<(String, Vec<String>)> {
    let mut id = None;
    let mut command = Vec::new();
    for (key, value) in pairs {
        match key.as_str() {
            "id" => id = Some(value),
            "command" => command.push(value),
            _ => {}
        }
    }
    let id = id.ok_or_else(|| ApiError::invalid("missing id"))?;
    if command.is_empty() {
        return Err(ApiError::invalid("missing command"));
    }
    Ok((id, command))
}

// ── WebSocket ──────────────────────────────────────────────────

/// GET /exec?id=&command=.. (WebSocket upgrade)
///
/// The session is opened before the upgrade, so a workload that is not
/// Running is refused with an ordinary HTTP error.
pub async fn exec_socket(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Query(pairs): Query<Vec<(String, String)>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Sessions)?;
    let ws = ws?;
    let (id, command) = exec_target(pairs)?;
    let session = state
        .sessions
        .open_exec(&principal, &id, ExecRequest::new(command))
        .await?;
    Ok(ws.on_upgrade(move |socket| bridge(socket, session)))
}

/// GET /connect?id= (WebSocket upgrade)
pub async fn connect_socket(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<IdQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Sessions)?;
    let ws = ws?;
    let session = state.sessions.open_connect(&principal, &query.id).await?;
    Ok(ws.on_upgrade(move |socket| bridge(socket, session)))
}

/// Frame sent to the client for one session event. Output travels as binary
/// frames; exit and close notices as JSON text frames.
pub fn frame_for(event: SessionEvent) -> Message {
    match event {
        SessionEvent::Output(chunk) => Message::Binary(chunk),
        SessionEvent::Exit(code) => {
            Message::Text(json!({ "type": "exit", "code": code }).to_string().into())
        }
        SessionEvent::Closed(reason) => Message::Text(
            json!({ "type": "closed", "reason": reason, "kind": reason.kind() })
                .to_string()
                .into(),
        ),
    }
}

async fn bridge(socket: WebSocket, session: InteractiveSession) {
    let InteractiveSession {
        id,
        input,
        mut events,
    } = session;
    let (mut sink, mut source) = socket.split();

    let to_process = async move {
        while let Some(Ok(message)) = source.next().await {
            let chunk = match message {
                Message::Binary(data) => data,
                Message::Text(text) => Bytes::copy_from_slice(text.as_str().as_bytes()),
                Message::Close(_) => break,
                _ => continue,
            };
            if input.send(chunk).await.is_err() {
                break;
            }
        }
    };

    let to_client = async move {
        while let Some(event) = events.recv().await {
            let last = matches!(event, SessionEvent::Closed(_));
            if sink.send(frame_for(event)).await.is_err() {
                return;
            }
            if last {
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    };

    // Whichever side finishes first ends the session; dropping the other
    // half releases the substrate channel.
    tokio::select! {
        _ = to_process => {}
        _ = to_client => {}
    }
    debug!(session_id = %id, "websocket closed");
}

/// POST /exec: run a command to completion.
pub async fn exec_buffered(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<ExecBody>,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Sessions)?;
    if body.command.is_empty() {
        return Err(ApiError::invalid("command must not be empty"));
    }
    let request = ExecRequest {
        command: body.command,
        env: body.env,
    };
    let output = state
        .sessions
        .exec_collect(&principal, &body.id, request)
        .await?;
    Ok(ApiResponse::ok(output).into_response())
}

// ── Server-Sent Events ─────────────────────────────────────────

/// Event name and JSON payload for one stream event.
pub fn sse_payload(event: &StreamEvent) -> (&'static str, Value) {
    match event {
        StreamEvent::Entry { seq, data } => ("entry", json!({ "seq": seq, "data": data })),
        StreamEvent::Gap { after, missed } => {
            ("gap", json!({ "after": after, "missed": missed }))
        }
        StreamEvent::Closed { reason } => (
            "closed",
            json!({ "reason": reason, "kind": reason.kind() }),
        ),
    }
}

fn sse_stream(session: StreamSession) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events: mpsc::Receiver<StreamEvent> = session.events;
    let stream = stream::unfold(events, |mut events| async move {
        let event = events.recv().await?;
        let (name, payload) = sse_payload(&event);
        Some((Ok(Event::default().event(name).data(payload.to_string())), events))
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE).text("keepalive"))
}

/// GET /logs?id= (SSE)
pub async fn follow_logs(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<IdQuery>,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Sessions)?;
    let session = state.sessions.open_logs(&principal, &query.id).await?;
    Ok(sse_stream(session).into_response())
}

/// GET /metrics/stream?id= (SSE)
pub async fn stream_metrics(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<IdQuery>,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Metrics)?;
    let session = state.sessions.open_metrics(&principal, &query.id).await?;
    Ok(sse_stream(session).into_response())
}

// ── Metrics ────────────────────────────────────────────────────

/// GET /metrics?id= for one workload's sample, or Prometheus text without.
pub async fn metrics(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<MetricsQuery>,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Metrics)?;
    match query.id {
        Some(id) => {
            let (_, handle) = state.orchestrator.running(&principal, &id)?;
            let sample = state.orchestrator.substrate().metrics(&handle).await?;
            Ok(ApiResponse::ok(sample).into_response())
        }
        None => {
            let snapshot = ControlPlaneSnapshot::collect(&state)?;
            Ok((
                StatusCode::OK,
                [(CONTENT_TYPE, prometheus::CONTENT_TYPE)],
                render_prometheus(&snapshot),
            )
                .into_response())
        }
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;
    use skiff_lifecycle::CreateRequest;
    use skiff_session::CloseReason;
    use skiff_state::{Workload, WorkloadState};

    use super::*;
    use crate::testing::{TestApi, api, principal, wait_for};

    fn user() -> Principal {
        principal("alice", &[Scope::Workloads, Scope::Sessions, Scope::Metrics])
    }

    async fn running(api: &TestApi) -> Workload {
        let created = api
            .state
            .orchestrator
            .create(
                &user(),
                CreateRequest {
                    image: Some("img".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        wait_for(api, &created.id, WorkloadState::Running).await
    }

    #[test]
    fn exec_target_keeps_command_order() {
        let pairs = vec![
            ("command".to_string(), "ls".to_string()),
            ("id".to_string(), "w-1".to_string()),
            ("command".to_string(), "-la".to_string()),
        ];
        let (id, command) = exec_target(pairs).unwrap();
        assert_eq!(id, "w-1");
        assert_eq!(command, vec!["ls", "-la"]);

        let err = exec_target(vec![("id".to_string(), "w-1".to_string())]).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn frames_for_session_events() {
        assert_eq!(
            frame_for(SessionEvent::Output(Bytes::from_static(b"hi"))),
            Message::Binary(Bytes::from_static(b"hi"))
        );
        let Message::Text(text) = frame_for(SessionEvent::Exit(3)) else {
            panic!("exit must be a text frame");
        };
        let value: Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(value, json!({ "type": "exit", "code": 3 }));

        let Message::Text(text) = frame_for(SessionEvent::Closed(CloseReason::WorkloadUnavailable))
        else {
            panic!("closed must be a text frame");
        };
        let value: Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(value["reason"], "workload_unavailable");
        assert_eq!(value["kind"], "workload_unavailable");
    }

    #[test]
    fn sse_payloads() {
        let (name, payload) = sse_payload(&StreamEvent::Entry {
            seq: 7,
            data: json!("line"),
        });
        assert_eq!(name, "entry");
        assert_eq!(payload, json!({ "seq": 7, "data": "line" }));

        let (name, payload) = sse_payload(&StreamEvent::Gap { after: 2, missed: 5 });
        assert_eq!(name, "gap");
        assert_eq!(payload, json!({ "after": 2, "missed": 5 }));

        let (name, payload) = sse_payload(&StreamEvent::Closed {
            reason: CloseReason::Completed,
        });
        assert_eq!(name, "closed");
        assert_eq!(payload["kind"], Value::Null);
    }

    #[tokio::test]
    async fn buffered_exec_returns_exit_code() {
        let api = api();
        let workload = running(&api).await;
        let resp = exec_buffered(
            State(api.state),
            Extension(user()),
            Json(ExecBody {
                id: workload.id,
                command: vec!["exit".to_string(), "3".to_string()],
                env: HashMap::new(),
            }),
        )
        .await
        .unwrap();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["data"]["exit_code"], 3);
    }

    #[tokio::test]
    async fn logs_stream_as_sse_entries() {
        let api = api();
        let workload = running(&api).await;
        let resp = follow_logs(
            State(api.state.clone()),
            Extension(user()),
            Query(IdQuery {
                id: workload.id.clone(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        api.substrate
            .emit_log(workload.handle.as_ref().unwrap(), "hello");
        let mut body = resp.into_body();
        let frame = body.frame().await.unwrap().unwrap();
        let text = String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap();
        assert!(text.contains("event: entry"));
        assert!(text.contains(r#""seq":1"#));
        assert!(text.contains("hello"));
    }

    #[tokio::test]
    async fn logs_refused_before_running() {
        let api = api();
        api.substrate.set_provision_delay(Duration::from_secs(30));
        let created = api
            .state
            .orchestrator
            .create(
                &user(),
                CreateRequest {
                    image: Some("img".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        let err = follow_logs(
            State(api.state),
            Extension(user()),
            Query(IdQuery { id: created.id }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.kind(), skiff_core::ErrorKind::NotRunning);
    }

    #[tokio::test]
    async fn metrics_sample_and_exposition() {
        let api = api();
        let workload = running(&api).await;

        let resp = metrics(
            State(api.state.clone()),
            Extension(user()),
            Query(MetricsQuery {
                id: Some(workload.id),
            }),
        )
        .await
        .unwrap();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["data"]["cpu_millis"], 500);

        let resp = metrics(State(api.state), Extension(user()), Query(MetricsQuery::default()))
            .await
            .unwrap();
        assert_eq!(
            resp.headers()[CONTENT_TYPE],
            "text/plain; version=0.0.4; charset=utf-8"
        );
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("skiff_workloads{state=\"running\"} 1\n"));
    }
}
