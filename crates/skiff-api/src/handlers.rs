//! Workload handlers: create, delete, status, file transfer, plus the
//! unauthenticated liveness and version endpoints.

use axum::body::Bytes;
use axum::extract::{Extension, State};
use axum::http::{StatusCode, Uri};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use skiff_auth::{Principal, Scope};
use skiff_lifecycle::CreateRequest;
use skiff_state::{WorkloadFilter, WorkloadState};

use crate::ApiState;
use crate::error::{ApiError, ApiResult};
use crate::extract::{Json, Query};
use crate::response::ApiResponse;

/// `?id=` selector used by most workload routes.
#[derive(Debug, Deserialize)]
pub struct IdQuery {
    pub id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StatusQuery {
    pub id: Option<String>,
    pub namespace: Option<String>,
    pub state: Option<WorkloadState>,
    pub include_deleted: bool,
}

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    pub id: String,
    pub path: String,
}

// ── System ─────────────────────────────────────────────────────

/// GET /health
pub async fn health(State(state): State<ApiState>) -> Response {
    let uptime_secs = state.started_at.elapsed().as_secs();
    match state.orchestrator.repo().health_check() {
        Ok(()) => ApiResponse::ok(json!({ "status": "ok", "uptime_secs": uptime_secs }))
            .into_response(),
        Err(e) => {
            warn!(error = %e, "repository health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                ApiResponse::ok(json!({
                    "status": "degraded",
                    "uptime_secs": uptime_secs,
                    "reason": e.to_string(),
                })),
            )
                .into_response()
        }
    }
}

/// GET /version
pub async fn version() -> impl IntoResponse {
    ApiResponse::ok(json!({
        "name": "skiff",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Fallback for paths no route matches.
pub async fn unknown_route(uri: Uri) -> ApiError {
    ApiError::not_found(format!("no route for {}", uri.path()))
}

// ── Workloads ──────────────────────────────────────────────────

/// POST /create
///
/// Answers with the Pending record; provisioning continues in the background.
pub async fn create_workload(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<CreateRequest>,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Workloads)?;
    let workload = state.orchestrator.create(&principal, request)?;
    Ok(ApiResponse::created(workload))
}

/// POST|DELETE /delete?id=
pub async fn delete_workload(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<IdQuery>,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Workloads)?;
    let workload = state.orchestrator.delete(&principal, &query.id).await?;
    Ok(ApiResponse::ok(workload).into_response())
}

/// GET /status?id= for one workload, or a list filtered by namespace/state.
pub async fn workload_status(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Workloads)?;
    if let Some(id) = query.id {
        let status = state.orchestrator.status(&principal, &id).await?;
        return Ok(ApiResponse::ok(status).into_response());
    }
    let filter = WorkloadFilter {
        namespace: query.namespace,
        owner: None,
        state: query.state,
        include_deleted: query.include_deleted,
    };
    let workloads = state.orchestrator.list(&principal, filter)?;
    Ok(ApiResponse::ok(workloads).into_response())
}

// ── Files ──────────────────────────────────────────────────────

/// POST /upload?id=&path= with the file as the raw body.
pub async fn upload_file(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<FileQuery>,
    body: Bytes,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Files)?;
    let (_, handle) = state.orchestrator.running(&principal, &query.id)?;
    let written = state
        .orchestrator
        .substrate()
        .upload(&handle, &query.path, body)
        .await?;
    Ok(ApiResponse::ok(json!({ "path": query.path, "bytes": written })).into_response())
}

/// GET /download?id=&path=
pub async fn download_file(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Files)?;
    let (_, handle) = state.orchestrator.running(&principal, &query.id)?;
    let data = state
        .orchestrator
        .substrate()
        .download(&handle, &query.path)
        .await?;
    Ok((
        StatusCode::OK,
        [(CONTENT_TYPE, "application/octet-stream")],
        data,
    )
        .into_response())
}
