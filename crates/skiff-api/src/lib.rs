//! skiff-api: HTTP API for Skiff.
//!
//! Every route except `/health` and `/version` requires an API key, passed
//! as `Authorization: Bearer <key>` or `X-API-Key: <key>`. JSON responses
//! use the envelope in [`response::ApiResponse`].
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/health` | Liveness |
//! | GET | `/version` | Build metadata |
//! | POST | `/create` | Create a workload |
//! | POST, DELETE | `/delete?id=` | Delete a workload |
//! | GET | `/status[?id=]` | One workload, or a filtered list |
//! | GET (WS) | `/exec?id=&command=` | Interactive exec |
//! | POST | `/exec` | Buffered exec |
//! | GET (WS) | `/connect?id=` | Attach a shell |
//! | GET (SSE) | `/logs?id=` | Follow logs |
//! | POST | `/upload?id=&path=` | Write a file into a workload |
//! | GET | `/download?id=&path=` | Read a file out of a workload |
//! | GET | `/metrics[?id=]` | One sample, or Prometheus exposition |
//! | GET (SSE) | `/metrics/stream?id=` | Periodic samples |
//! | POST | `/snapshot/create` | Checkpoint a workload |
//! | POST | `/snapshot/restore` | New workload from a snapshot |
//! | POST, DELETE | `/snapshot/delete?id=` | Delete a snapshot |
//! | GET | `/snapshot/list?workload_id=` | Snapshots of a workload |
//! | GET | `/templates`, `/templates/{id}` | Template catalog |
//! | GET, POST, DELETE | `/apikeys` | Key management |
//! | GET, POST, DELETE | `/quotas` | Ceilings and usage |
//! | GET, POST | `/machine/health` | Machine health |
//! | GET, POST, PUT, DELETE | `/namespaces` | Namespaces |
//! | GET, POST, DELETE | `/secrets` | Namespace secrets |

pub mod admin_handlers;
pub mod auth;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod prometheus;
pub mod response;
pub mod session_handlers;
pub mod snapshot_handlers;

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};

use skiff_auth::AuthGate;
use skiff_health::HealthAggregator;
use skiff_lifecycle::{Namespaces, Orchestrator};
use skiff_quota::QuotaEngine;
use skiff_session::SessionManager;
use skiff_snapshot::SnapshotManager;

pub use error::{ApiError, ApiResult};

/// Largest body accepted by `/upload`.
pub const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub auth: Arc<AuthGate>,
    pub orchestrator: Arc<Orchestrator>,
    pub namespaces: Arc<Namespaces>,
    pub sessions: Arc<SessionManager>,
    pub snapshots: Arc<SnapshotManager>,
    pub health: Arc<HealthAggregator>,
    pub started_at: Instant,
}

impl ApiState {
    pub fn quota(&self) -> &Arc<QuotaEngine> {
        self.orchestrator.quota()
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let protected = Router::new()
        .route("/create", post(handlers::create_workload))
        .route(
            "/delete",
            post(handlers::delete_workload).delete(handlers::delete_workload),
        )
        .route("/status", get(handlers::workload_status))
        .route(
            "/upload",
            post(handlers::upload_file).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/download", get(handlers::download_file))
        .route(
            "/exec",
            get(session_handlers::exec_socket).post(session_handlers::exec_buffered),
        )
        .route("/connect", get(session_handlers::connect_socket))
        .route("/logs", get(session_handlers::follow_logs))
        .route("/metrics", get(session_handlers::metrics))
        .route("/metrics/stream", get(session_handlers::stream_metrics))
        .route("/snapshot/create", post(snapshot_handlers::create_snapshot))
        .route("/snapshot/restore", post(snapshot_handlers::restore_snapshot))
        .route(
            "/snapshot/delete",
            post(snapshot_handlers::delete_snapshot).delete(snapshot_handlers::delete_snapshot),
        )
        .route("/snapshot/list", get(snapshot_handlers::list_snapshots))
        .route("/templates", get(admin_handlers::list_templates))
        .route("/templates/{id}", get(admin_handlers::get_template))
        .route(
            "/apikeys",
            get(admin_handlers::list_keys)
                .post(admin_handlers::issue_key)
                .delete(admin_handlers::revoke_key),
        )
        .route(
            "/quotas",
            get(admin_handlers::get_quotas)
                .post(admin_handlers::set_quota)
                .delete(admin_handlers::clear_quota),
        )
        .route(
            "/machine/health",
            get(admin_handlers::machine_health).post(admin_handlers::report_machine_health),
        )
        .route(
            "/namespaces",
            get(admin_handlers::list_namespaces)
                .post(admin_handlers::create_namespace)
                .put(admin_handlers::update_namespace)
                .delete(admin_handlers::delete_namespace),
        )
        .route(
            "/secrets",
            get(admin_handlers::list_secrets)
                .post(admin_handlers::put_secret)
                .delete(admin_handlers::delete_secret),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_key,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/version", get(handlers::version))
        .merge(protected)
        .fallback(handlers::unknown_route)
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use skiff_auth::{Principal, Scope};
    use skiff_core::config::{LifecycleConfig, SessionConfig};
    use skiff_core::{Template, TemplateCatalog};
    use skiff_state::{Repository, SecretSealer, StateStore, Workload, WorkloadState};
    use skiff_substrate::FakeSubstrate;

    use super::*;

    pub struct TestApi {
        pub state: ApiState,
        pub store: Arc<StateStore>,
        pub substrate: Arc<FakeSubstrate>,
    }

    pub fn api() -> TestApi {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let substrate = Arc::new(FakeSubstrate::new());
        let sealer = Arc::new(SecretSealer::from_passphrase("test"));
        let health = Arc::new(HealthAggregator::new(Duration::from_secs(60)));
        let templates = TemplateCatalog::new([Template {
            id: "python".to_string(),
            description: "Python 3".to_string(),
            image: "python:3.12".to_string(),
            command: vec!["python3".to_string()],
            env: Default::default(),
            resources: None,
        }]);
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            substrate.clone(),
            Arc::new(QuotaEngine::unlimited()),
            health.clone(),
            Arc::new(templates),
            sealer.clone(),
            LifecycleConfig::default(),
        ));
        let sessions = Arc::new(SessionManager::new(
            orchestrator.clone(),
            SessionConfig::default(),
        ));
        let state = ApiState {
            auth: Arc::new(AuthGate::new()),
            namespaces: Arc::new(Namespaces::new(store.clone(), sealer)),
            snapshots: Arc::new(SnapshotManager::new(orchestrator.clone())),
            orchestrator,
            sessions,
            health,
            started_at: Instant::now(),
        };
        TestApi {
            state,
            store,
            substrate,
        }
    }

    pub fn principal(id: &str, scopes: &[Scope]) -> Principal {
        Principal {
            id: id.to_string(),
            label: id.to_string(),
            scopes: scopes.iter().copied().collect::<BTreeSet<_>>(),
        }
    }

    pub fn admin() -> Principal {
        principal("root", &[Scope::Wildcard])
    }

    pub async fn wait_for(api: &TestApi, id: &str, state: WorkloadState) -> Workload {
        for _ in 0..400 {
            let workload = api.store.get_workload(id).unwrap();
            if workload.state == state {
                return workload;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("workload {id} never reached {state}");
    }
}
