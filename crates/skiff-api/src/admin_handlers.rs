//! Templates, API keys, quotas, machine health, namespaces and secrets.

use axum::extract::{Extension, State};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

use skiff_auth::{Principal, Scope};
use skiff_core::{Ceiling, ErrorKind};
use skiff_health::MachineStatus;
use skiff_quota::QuotaSubject;
use skiff_state::{ResourcePolicy, StoredCeiling};

use crate::ApiState;
use crate::error::{ApiError, ApiResult};
use crate::extract::{Json, Path, Query};
use crate::handlers::IdQuery;
use crate::response::ApiResponse;

// ── Templates ──────────────────────────────────────────────────

/// GET /templates
pub async fn list_templates(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Templates)?;
    Ok(ApiResponse::ok(state.orchestrator.templates().list()).into_response())
}

/// GET /templates/{id}
pub async fn get_template(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Templates)?;
    match state.orchestrator.templates().get(&id) {
        Some(template) => Ok(ApiResponse::ok(template).into_response()),
        None => Err(ApiError::not_found(format!("template {id}"))),
    }
}

// ── API keys ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct IssueKeyBody {
    pub label: String,
    pub scopes: Vec<String>,
}

/// GET /apikeys
pub async fn list_keys(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Admin)?;
    Ok(ApiResponse::ok(state.auth.list()).into_response())
}

/// POST /apikeys
///
/// The response carries the secret; it is never shown again.
pub async fn issue_key(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<IssueKeyBody>,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Admin)?;
    if body.label.trim().is_empty() || body.scopes.is_empty() {
        return Err(ApiError::invalid("label and at least one scope are required"));
    }
    let scopes = Scope::parse_all(&body.scopes)?;
    let issued = state.auth.issue(&body.label, scopes)?;
    Ok(ApiResponse::created(issued))
}

/// DELETE /apikeys?id=
pub async fn revoke_key(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<IdQuery>,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Admin)?;
    state.auth.revoke(&query.id)?;
    Ok(ApiResponse::ok(json!({ "revoked": query.id })).into_response())
}

// ── Quotas ─────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SubjectQuery {
    pub kind: Option<String>,
    pub id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetQuotaBody {
    pub subject: QuotaSubject,
    pub ceiling: Ceiling,
}

fn parse_subject(kind: &str, id: String) -> ApiResult<QuotaSubject> {
    QuotaSubject::from_parts(kind, id)
        .ok_or_else(|| ApiError::invalid(format!("unknown quota subject kind: {kind}")))
}

impl SubjectQuery {
    fn subject(self) -> ApiResult<Option<QuotaSubject>> {
        match (self.kind, self.id) {
            (Some(kind), Some(id)) => parse_subject(&kind, id).map(Some),
            (None, None) => Ok(None),
            _ => Err(ApiError::invalid("kind and id must be given together")),
        }
    }
}

/// Non-admins may read their own principal and the namespaces they own.
fn may_read(state: &ApiState, principal: &Principal, subject: &QuotaSubject) -> ApiResult<()> {
    let allowed = principal.is_admin()
        || match subject {
            QuotaSubject::Principal(id) => *id == principal.id,
            QuotaSubject::Namespace(name) => state
                .namespaces
                .get(name)
                .map(|ns| ns.owner == principal.id)
                .unwrap_or(false),
        };
    if allowed {
        Ok(())
    } else {
        Err(ApiError::new(
            ErrorKind::Forbidden,
            format!("quota of {subject} is not visible to this key"),
        ))
    }
}

/// GET /quotas[?kind=&id=]
pub async fn get_quotas(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<SubjectQuery>,
) -> ApiResult<Response> {
    match query.subject()? {
        Some(subject) => {
            may_read(&state, &principal, &subject)?;
            Ok(ApiResponse::ok(state.quota().report(&subject)).into_response())
        }
        None if principal.is_admin() => Ok(ApiResponse::ok(state.quota().reports()).into_response()),
        None => {
            let own = state
                .quota()
                .report(&QuotaSubject::Principal(principal.id.clone()));
            Ok(ApiResponse::ok(vec![own]).into_response())
        }
    }
}

/// POST /quotas
pub async fn set_quota(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<SetQuotaBody>,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Admin)?;
    state.orchestrator.repo().put_ceiling(&StoredCeiling {
        kind: body.subject.kind().to_string(),
        id: body.subject.id().to_string(),
        ceiling: body.ceiling,
    })?;
    state.quota().set_ceiling(body.subject.clone(), body.ceiling);
    Ok(ApiResponse::ok(state.quota().report(&body.subject)).into_response())
}

/// DELETE /quotas?kind=&id=
pub async fn clear_quota(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<SubjectQuery>,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Admin)?;
    let subject = query
        .subject()?
        .ok_or_else(|| ApiError::invalid("kind and id are required"))?;
    let stored = state
        .orchestrator
        .repo()
        .delete_ceiling(subject.kind(), subject.id())?;
    let cleared = state.quota().clear_ceiling(&subject);
    if !(stored || cleared) {
        return Err(ApiError::not_found(format!("no explicit ceiling for {subject}")));
    }
    Ok(ApiResponse::ok(state.quota().report(&subject)).into_response())
}

// ── Machine health ─────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MachineQuery {
    pub id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MachineReport {
    pub machine_id: String,
    pub status: MachineStatus,
}

/// GET /machine/health[?id=]
pub async fn machine_health(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<MachineQuery>,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Metrics)?;
    match query.id {
        Some(id) => match state.health.get(&id) {
            Some(health) => Ok(ApiResponse::ok(health).into_response()),
            None => Err(ApiError::not_found(format!("machine {id}"))),
        },
        None => Ok(ApiResponse::ok(state.health.list()).into_response()),
    }
}

/// POST /machine/health, for collectors.
pub async fn report_machine_health(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Json(report): Json<MachineReport>,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Admin)?;
    if report.machine_id.is_empty() {
        return Err(ApiError::invalid("machine_id must not be empty"));
    }
    let health = state.health.report(&report.machine_id, report.status);
    Ok(ApiResponse::ok(health).into_response())
}

// ── Namespaces ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct NamespaceBody {
    pub name: String,
    #[serde(default)]
    pub policy: ResourcePolicy,
}

#[derive(Debug, Deserialize)]
pub struct NameQuery {
    pub name: String,
}

/// GET /namespaces
pub async fn list_namespaces(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Namespaces)?;
    let visible: Vec<_> = state
        .namespaces
        .list()?
        .into_iter()
        .filter(|ns| principal.may_act_on(&ns.owner))
        .collect();
    Ok(ApiResponse::ok(visible).into_response())
}

/// POST /namespaces
pub async fn create_namespace(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<NamespaceBody>,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Namespaces)?;
    let namespace = state
        .namespaces
        .create(&principal, &body.name, body.policy)?;
    Ok(ApiResponse::created(namespace))
}

/// PUT /namespaces: replace the resource policy.
pub async fn update_namespace(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<NamespaceBody>,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Namespaces)?;
    let namespace = state
        .namespaces
        .set_policy(&principal, &body.name, body.policy)?;
    Ok(ApiResponse::ok(namespace).into_response())
}

/// DELETE /namespaces?name=
pub async fn delete_namespace(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<NameQuery>,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Namespaces)?;
    state.namespaces.delete(&principal, &query.name)?;
    Ok(ApiResponse::ok(json!({ "deleted": query.name })).into_response())
}

// ── Secrets ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SecretBody {
    pub namespace: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct NamespaceQuery {
    pub namespace: String,
}

#[derive(Debug, Deserialize)]
pub struct SecretQuery {
    pub namespace: String,
    pub key: String,
}

/// GET /secrets?namespace=: keys and versions, never values.
pub async fn list_secrets(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<NamespaceQuery>,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Secrets)?;
    let secrets = state
        .namespaces
        .list_secrets(&principal, &query.namespace)?;
    Ok(ApiResponse::ok(secrets).into_response())
}

/// POST /secrets
pub async fn put_secret(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<SecretBody>,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Secrets)?;
    let info = state
        .namespaces
        .put_secret(&principal, &body.namespace, &body.key, &body.value)?;
    Ok(ApiResponse::created(info))
}

/// DELETE /secrets?namespace=&key=
pub async fn delete_secret(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<SecretQuery>,
) -> ApiResult<Response> {
    state.auth.require(&principal, Scope::Secrets)?;
    state
        .namespaces
        .delete_secret(&principal, &query.namespace, &query.key)?;
    Ok(ApiResponse::ok(json!({ "deleted": query.key })).into_response())
}
