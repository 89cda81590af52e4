//! Snapshot handlers.

use axum::extract::{Extension, State};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

use skiff_auth::{Principal, Scope};
use skiff_lifecycle::CreateRequest;

use crate::ApiState;
use crate::error::ApiResult;
use crate::extract::{Json, Query};
use crate::handlers::IdQuery;
use crate::response::ApiResponse;

#[derive(Debug, Deserialize)]
pub struct CreateSnapshotBody {
    pub workload_id: String,
}

/// Restore target: the snapshot plus any create fields to override.
#[derive(Debug, Deserialize)]
pub struct RestoreBody {
    pub snapshot_id: String,
    #[serde(flatten)]
    pub target: CreateRequest,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub workload_id: String,
}

/// POST /snapshot/create
pub async fn create_snapshot(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<CreateSnapshotBody>,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Snapshots)?;
    let snapshot = state
        .snapshots
        .create(&principal, &body.workload_id)
        .await?;
    Ok(ApiResponse::created(snapshot))
}

/// POST /snapshot/restore
///
/// Answers with the new Pending workload.
pub async fn restore_snapshot(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<RestoreBody>,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Snapshots)?;
    state.auth.require(&principal, Scope::Workloads)?;
    let workload = state
        .snapshots
        .restore(&principal, &body.snapshot_id, body.target)?;
    Ok(ApiResponse::created(workload))
}

/// POST|DELETE /snapshot/delete?id=
pub async fn delete_snapshot(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<IdQuery>,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Snapshots)?;
    state.snapshots.delete(&principal, &query.id).await?;
    Ok(ApiResponse::ok(json!({ "deleted": query.id })).into_response())
}

/// GET /snapshot/list?workload_id=
pub async fn list_snapshots(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Snapshots)?;
    let snapshots = state.snapshots.list(&principal, &query.workload_id)?;
    Ok(ApiResponse::ok(snapshots).into_response())
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use skiff_state::WorkloadState;

    use super::*;
    use crate::testing::{api, principal, wait_for};

    async fn body_json(resp: Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn user() -> Principal {
        principal("alice", &[Scope::Workloads, Scope::Snapshots])
    }

    #[tokio::test]
    async fn create_list_restore_delete() {
        let api = api();
        let source = api
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
        wait_for(&api, &source.id, WorkloadState::Running).await;

        let resp = create_snapshot(
            State(api.state.clone()),
            Extension(user()),
            Json(CreateSnapshotBody {
                workload_id: source.id.clone(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let snapshot_id = body_json(resp).await["data"]["id"]
            .as_str()
            .unwrap()
            .to_string();

        let resp = list_snapshots(
            State(api.state.clone()),
            Extension(user()),
            Query(ListQuery {
                workload_id: source.id.clone(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(body_json(resp).await["data"].as_array().unwrap().len(), 1);

        let resp = restore_snapshot(
            State(api.state.clone()),
            Extension(user()),
            Json(RestoreBody {
                snapshot_id: snapshot_id.clone(),
                target: CreateRequest::default(),
            }),
        )
        .await
        .unwrap();
        let restored = body_json(resp).await;
        assert_eq!(restored["data"]["state"], "pending");
        assert_eq!(restored["data"]["restored_from"]["snapshot_id"], snapshot_id);
        let restored_id = restored["data"]["id"].as_str().unwrap().to_string();
        wait_for(&api, &restored_id, WorkloadState::Running).await;
        while api.state.snapshots.restores_in_progress(&snapshot_id) > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        delete_snapshot(
            State(api.state),
            Extension(user()),
            Query(IdQuery { id: snapshot_id }),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn snapshot_of_missing_workload_is_not_found() {
        let api = api();
        let err = create_snapshot(
            State(api.state),
            Extension(user()),
            Json(CreateSnapshotBody {
                workload_id: "w-missing".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn restore_body_flattens_overrides() {
        let body: RestoreBody = serde_json::from_value(serde_json::json!({
            "snapshot_id": "snap-1",
            "namespace": "team-a",
        }))
        .unwrap();
        assert_eq!(body.snapshot_id, "snap-1");
        assert_eq!(body.target.namespace.as_deref(), Some("team-a"));
    }
}
