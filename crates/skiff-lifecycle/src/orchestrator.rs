//! The orchestrator: the only writer of workload state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use skiff_auth::Principal;
use skiff_core::config::LifecycleConfig;
use skiff_core::{ResourceRequest, SubstrateHandle, TemplateCatalog, epoch_secs};
use skiff_health::HealthAggregator;
use skiff_quota::{QuotaEngine, Token};
use skiff_state::{
    Namespace, Repository, ResourcePolicy, RestoreSeed, SecretSealer, StateError, Transition,
    Workload, WorkloadFilter, WorkloadId, WorkloadSpec, WorkloadState,
};
use skiff_substrate::{CheckpointRef, ProvisionSpec, Substrate, SubstrateError, SubstrateResult, UnitStatus};

use crate::error::{LifecycleError, LifecycleResult};
use crate::namespaces::{DEFAULT_NAMESPACE, validate_name};
use crate::retry::RetryPolicy;

/// Body of a create request. Fields left out fall back to the template,
/// then to the namespace policy, then to daemon defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateRequest {
    pub namespace: Option<String>,
    pub template: Option<String>,
    pub image: Option<String>,
    pub command: Option<Vec<String>>,
    pub env: HashMap<String, String>,
    pub secrets: Vec<String>,
    pub resources: Option<ResourceRequest>,
}

/// Whoever tracks attached sessions. Called whenever a workload leaves
/// Running so its sessions end with `WorkloadUnavailable`.
#[async_trait]
pub trait SessionCloser: Send + Sync {
    async fn close_all(&self, workload_id: &str);
}

/// A workload record plus what the substrate says about its unit.
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadStatus {
    #[serde(flatten)]
    pub workload: Workload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<UnitStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_error: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Workloads moved to Failed (start deadline or vanished unit).
    pub failed: usize,
    /// Tombstones removed.
    pub purged: usize,
}

pub struct Orchestrator {
    repo: Arc<dyn Repository>,
    substrate: Arc<dyn Substrate>,
    quota: Arc<QuotaEngine>,
    health: Arc<HealthAggregator>,
    templates: Arc<TemplateCatalog>,
    sealer: Arc<SecretSealer>,
    config: LifecycleConfig,
    retry: RetryPolicy,
    /// Outstanding quota tokens by workload. Removing an entry is what
    /// makes a release happen at most once.
    reservations: Mutex<HashMap<WorkloadId, Token>>,
    sessions: OnceLock<Arc<dyn SessionCloser>>,
}

impl Orchestrator {
    pub fn new(
        repo: Arc<dyn Repository>,
        substrate: Arc<dyn Substrate>,
        quota: Arc<QuotaEngine>,
        health: Arc<HealthAggregator>,
        templates: Arc<TemplateCatalog>,
        sealer: Arc<SecretSealer>,
        config: LifecycleConfig,
    ) -> Self {
        let retry = RetryPolicy::from(&config.retry);
        Self {
            repo,
            substrate,
            quota,
            health,
            templates,
            sealer,
            config,
            retry,
            reservations: Mutex::new(HashMap::new()),
            sessions: OnceLock::new(),
        }
    }

    /// Register the session registry. Only the first call takes effect.
    pub fn attach_sessions(&self, closer: Arc<dyn SessionCloser>) {
        if self.sessions.set(closer).is_err() {
            warn!("session closer already attached, ignoring");
        }
    }

    pub fn repo(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    pub fn substrate(&self) -> &Arc<dyn Substrate> {
        &self.substrate
    }

    pub fn quota(&self) -> &Arc<QuotaEngine> {
        &self.quota
    }

    pub fn templates(&self) -> &TemplateCatalog {
        &self.templates
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    fn reservations(&self) -> MutexGuard<'_, HashMap<WorkloadId, Token>> {
        self.reservations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn release_reservation(&self, id: &str) {
        let token = self.reservations().remove(id);
        if let Some(token) = token {
            self.quota.release(&token);
            debug!(workload_id = %id, "quota released");
        }
    }

    fn handle_of(&self, workload: &Workload) -> SubstrateHandle {
        workload
            .handle
            .clone()
            .unwrap_or_else(|| SubstrateHandle::for_workload(&self.config.handle_prefix, &workload.id))
    }

    async fn close_sessions(&self, id: &str) {
        if let Some(closer) = self.sessions.get() {
            closer.close_all(id).await;
        }
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Fetch a workload the principal owns (or may act on as admin).
    pub fn authorize(&self, principal: &Principal, id: &str) -> LifecycleResult<Workload> {
        let workload = self.repo.get_workload(id)?;
        if !principal.may_act_on(&workload.owner) {
            return Err(LifecycleError::Forbidden(format!(
                "workload {id} belongs to another principal"
            )));
        }
        Ok(workload)
    }

    /// Workload plus its handle, provided it is Running.
    pub fn running(
        &self,
        principal: &Principal,
        id: &str,
    ) -> LifecycleResult<(Workload, SubstrateHandle)> {
        let workload = self.authorize(principal, id)?;
        let handle = match workload.state {
            WorkloadState::Running => workload.handle.clone(),
            _ => None,
        };
        match handle {
            Some(handle) => Ok((workload, handle)),
            None => Err(LifecycleError::NotRunning {
                id: id.to_string(),
                state: workload.state,
            }),
        }
    }

    pub async fn status(&self, principal: &Principal, id: &str) -> LifecycleResult<WorkloadStatus> {
        let workload = self.authorize(principal, id)?;
        let (unit, unit_error) = match &workload.handle {
            Some(handle) => match self.substrate.inspect(handle).await {
                Ok(status) => (Some(status), None),
                Err(e) => (None, Some(e.to_string())),
            },
            None => (None, None),
        };
        Ok(WorkloadStatus {
            workload,
            unit,
            unit_error,
        })
    }

    /// List workloads. Non-admin principals only see their own.
    pub fn list(
        &self,
        principal: &Principal,
        mut filter: WorkloadFilter,
    ) -> LifecycleResult<Vec<Workload>> {
        if !principal.is_admin() {
            filter.owner = Some(principal.id.clone());
        }
        Ok(self.repo.list_workloads(&filter)?)
    }

    // ── Create ─────────────────────────────────────────────────────

    /// Admit a workload and start provisioning it in the background.
    /// Returns the Pending record.
    pub fn create(
        self: &Arc<Self>,
        principal: &Principal,
        request: CreateRequest,
    ) -> LifecycleResult<Workload> {
        let workload = self.admit(principal, request, None)?;
        self.spawn_provision(workload.id.clone());
        Ok(workload)
    }

    /// Validate, reserve quota, and record a Pending workload.
    pub fn admit(
        &self,
        principal: &Principal,
        request: CreateRequest,
        seed: Option<RestoreSeed>,
    ) -> LifecycleResult<Workload> {
        let ns_name = request
            .namespace
            .clone()
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        validate_name("namespace", &ns_name, &[])?;

        let (spec, template_resources) = self.resolve_spec(&request)?;
        let namespace = self.repo.ensure_namespace(&Namespace {
            name: ns_name.clone(),
            owner: principal.id.clone(),
            policy: ResourcePolicy::default(),
            created_at: epoch_secs(),
        })?;

        let resources = request
            .resources
            .or(template_resources)
            .or(namespace.policy.default_request)
            .unwrap_or(self.config.default_resources);
        if let Some(max) = namespace.policy.max_per_workload {
            if !resources.fits_within(&max) {
                return Err(LifecycleError::InvalidRequest(format!(
                    "request exceeds the per-workload maximum of namespace {ns_name}"
                )));
            }
        }

        for key in &spec.secrets {
            self.repo.get_secret(&ns_name, key)?;
        }

        let token = self.quota.reserve(&principal.id, &ns_name, resources)?;
        let id = new_workload_id();
        // The token must be findable before the record is visible, or a
        // delete racing this create would have nothing to release.
        self.reservations().insert(id.clone(), token);
        let now = epoch_secs();
        let workload = Workload {
            id,
            namespace: ns_name,
            owner: principal.id.clone(),
            spec,
            resources,
            state: WorkloadState::Pending,
            handle: None,
            failure: None,
            restored_from: seed,
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.repo.create_workload(&workload) {
            self.release_reservation(&workload.id);
            return Err(e.into());
        }

        info!(
            workload_id = %workload.id,
            namespace = %workload.namespace,
            owner = %workload.owner,
            image = %workload.spec.image,
            "workload admitted"
        );
        Ok(workload)
    }

    fn resolve_spec(
        &self,
        request: &CreateRequest,
    ) -> LifecycleResult<(WorkloadSpec, Option<ResourceRequest>)> {
        let template = match &request.template {
            Some(id) => Some(self.templates.get(id).ok_or_else(|| {
                LifecycleError::InvalidRequest(format!("unknown template {id}"))
            })?),
            None => None,
        };

        let image = request
            .image
            .clone()
            .filter(|image| !image.is_empty())
            .or_else(|| template.map(|t| t.image.clone()))
            .ok_or_else(|| LifecycleError::InvalidRequest("image is required".to_string()))?;
        let command = request
            .command
            .clone()
            .or_else(|| template.map(|t| t.command.clone()))
            .unwrap_or_default();
        let mut env = template.map(|t| t.env.clone()).unwrap_or_default();
        env.extend(request.env.clone());

        let spec = WorkloadSpec {
            image,
            command,
            env,
            secrets: request.secrets.clone(),
            template: request.template.clone(),
        };
        Ok((spec, template.and_then(|t| t.resources)))
    }

    // ── Provisioning ───────────────────────────────────────────────

    pub fn spawn_provision(self: &Arc<Self>, id: WorkloadId) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.provision(&id).await })
    }

    async fn provision(&self, id: &str) {
        let handle = SubstrateHandle::for_workload(&self.config.handle_prefix, id);
        let transition = Transition::to(WorkloadState::Starting).with_handle(handle);
        match self.repo.update_state(id, WorkloadState::Pending, transition) {
            Ok(workload) => self.bring_up(workload).await,
            Err(e) => debug!(workload_id = %id, error = %e, "provisioning abandoned before start"),
        }
    }

    /// Drive a Starting workload to Running or Failed.
    async fn bring_up(&self, workload: Workload) {
        let id = workload.id.as_str();
        let handle = self.handle_of(&workload);

        let spec = match self.provision_spec(&workload) {
            Ok(spec) => spec,
            Err(e) => {
                self.fail(&workload, format!("cannot resolve secrets: {e}"))
                    .await;
                return;
            }
        };

        match self.start_unit(&handle, &spec).await {
            Ok(()) => {
                let transition = Transition::to(WorkloadState::Running);
                match self.repo.update_state(id, WorkloadState::Starting, transition) {
                    Ok(_) => info!(workload_id = %id, %handle, "workload running"),
                    Err(e) => {
                        warn!(workload_id = %id, error = %e, "workload left Starting during provisioning, discarding unit");
                        self.discard_unit(&handle).await;
                    }
                }
            }
            Err(e) => {
                self.fail(&workload, e.to_string()).await;
            }
        }
    }

    /// Provision a Running workload's unit again after a restart. Units
    /// that survived are left as they are; a unit that cannot come back
    /// fails the workload.
    async fn reattach(&self, workload: Workload) {
        let handle = self.handle_of(&workload);
        let started = match self.provision_spec(&workload) {
            Ok(spec) => self.start_unit(&handle, &spec).await.map_err(|e| e.to_string()),
            Err(e) => Err(format!("cannot resolve secrets: {e}")),
        };
        match started {
            Ok(()) => debug!(workload_id = %workload.id, %handle, "unit reattached"),
            Err(reason) => {
                self.fail(&workload, reason).await;
            }
        }
    }

    async fn start_unit(&self, handle: &SubstrateHandle, spec: &ProvisionSpec) -> SubstrateResult<()> {
        let substrate = &self.substrate;
        self.retry
            .run("provision", move || substrate.provision(handle, spec))
            .await?;
        self.retry
            .run("wait_ready", move || substrate.wait_ready(handle))
            .await
    }

    fn provision_spec(&self, workload: &Workload) -> LifecycleResult<ProvisionSpec> {
        let mut env = workload.spec.env.clone();
        for key in &workload.spec.secrets {
            let secret = self.repo.get_secret(&workload.namespace, key)?;
            let plain = self.sealer.open(&secret.sealed)?;
            let value = String::from_utf8(plain).map_err(|_| {
                LifecycleError::InvalidRequest(format!("secret {key} is not valid UTF-8"))
            })?;
            env.insert(key.clone(), value);
        }
        Ok(ProvisionSpec {
            workload_id: workload.id.clone(),
            namespace: workload.namespace.clone(),
            image: workload.spec.image.clone(),
            command: workload.spec.command.clone(),
            env,
            resources: workload.resources,
            seed: workload.restored_from.as_ref().map(|seed| CheckpointRef {
                storage_ref: seed.storage_ref.clone(),
                size_bytes: 0,
            }),
            avoid: self.health.avoid_list(),
        })
    }

    /// Move a workload to Failed from the state `workload` was read in. On
    /// success the unit is torn down and the reservation released. Returns
    /// false if another transition got there first.
    ///
    /// A lost race only tears the unit down when the winning state no
    /// longer holds a handle: Running keeps its unit, and Stopping is
    /// already being torn down by the delete that won.
    async fn fail(&self, workload: &Workload, reason: String) -> bool {
        let id = workload.id.as_str();
        let handle = self.handle_of(workload);
        let transition = Transition::to(WorkloadState::Failed).with_reason(reason.clone());
        match self.repo.update_state(id, workload.state, transition) {
            Ok(_) => {
                warn!(workload_id = %id, %reason, "workload failed");
                self.close_sessions(id).await;
                self.discard_unit(&handle).await;
                self.release_reservation(id);
                true
            }
            Err(StateError::Conflict { actual, .. }) if !actual.holds_handle() => {
                debug!(workload_id = %id, %actual, "failure transition lost race, discarding unit");
                self.discard_unit(&handle).await;
                false
            }
            Err(e) => {
                debug!(workload_id = %id, error = %e, "failure transition lost race");
                false
            }
        }
    }

    /// Best-effort teardown.
    async fn discard_unit(&self, handle: &SubstrateHandle) {
        let substrate = &self.substrate;
        if let Err(e) = self
            .retry
            .run("teardown", move || substrate.teardown(handle))
            .await
        {
            error!(%handle, error = %e, "teardown failed");
        }
    }

    // ── Delete ─────────────────────────────────────────────────────

    /// Delete a workload. Deleting a tombstone returns it unchanged; a
    /// delete already in flight yields `Conflict`.
    pub async fn delete(self: &Arc<Self>, principal: &Principal, id: &str) -> LifecycleResult<Workload> {
        let mut workload = self.authorize(principal, id)?;
        loop {
            let from = workload.state;
            let to = match from {
                WorkloadState::Deleted => return Ok(workload),
                WorkloadState::Stopping => {
                    return Err(LifecycleError::Conflict(format!(
                        "workload {id} is already being deleted"
                    )));
                }
                WorkloadState::Starting | WorkloadState::Running => WorkloadState::Stopping,
                WorkloadState::Pending | WorkloadState::Stopped | WorkloadState::Failed => {
                    WorkloadState::Deleted
                }
            };
            match self.repo.update_state(id, from, Transition::to(to)) {
                Ok(updated) if updated.state == WorkloadState::Deleted => {
                    self.release_reservation(id);
                    info!(workload_id = %id, "workload deleted");
                    return Ok(updated);
                }
                Ok(_) => break,
                // Provisioning moved it forward; delete from the new state.
                Err(StateError::Conflict { actual, .. })
                    if matches!(
                        (from, actual),
                        (WorkloadState::Pending, WorkloadState::Starting)
                            | (WorkloadState::Starting, WorkloadState::Running)
                    ) =>
                {
                    workload = self.repo.get_workload(id)?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Past this point the teardown must finish even if the caller
        // stops waiting.
        let this = Arc::clone(self);
        let owned_id = id.to_string();
        tokio::spawn(async move { this.finish_delete(&owned_id).await })
            .await
            .map_err(|e| LifecycleError::Task(e.to_string()))?
    }

    /// Stopping → Stopped → Deleted, or Failed if the teardown fails.
    async fn finish_delete(&self, id: &str) -> LifecycleResult<Workload> {
        let workload = self.repo.get_workload(id)?;
        let handle = self.handle_of(&workload);
        self.close_sessions(id).await;

        let substrate = &self.substrate;
        let handle_ref = &handle;
        match self
            .retry
            .run("teardown", move || substrate.teardown(handle_ref))
            .await
        {
            Ok(()) => {
                self.repo
                    .update_state(id, WorkloadState::Stopping, Transition::to(WorkloadState::Stopped))?;
                let deleted = self
                    .repo
                    .update_state(id, WorkloadState::Stopped, Transition::to(WorkloadState::Deleted))?;
                self.release_reservation(id);
                info!(workload_id = %id, %handle, "workload deleted");
                Ok(deleted)
            }
            Err(e) => {
                let transition = Transition::to(WorkloadState::Failed)
                    .with_reason(format!("teardown failed: {e}"));
                self.repo.update_state(id, WorkloadState::Stopping, transition)?;
                self.release_reservation(id);
                error!(workload_id = %id, %handle, error = %e, "teardown failed, workload marked failed");
                Err(e.into())
            }
        }
    }

    // ── Background maintenance ─────────────────────────────────────

    /// One reconciliation pass at wall-clock time `now` (unix seconds).
    pub async fn reconcile(&self, now: u64) -> LifecycleResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let deadline = self.config.start_deadline;
        for workload in self.repo.list_workloads(&by_state(WorkloadState::Starting))? {
            if now.saturating_sub(workload.updated_at) > deadline.as_secs() {
                let reason = format!("not ready within {}s", deadline.as_secs());
                if self.fail(&workload, reason).await {
                    report.failed += 1;
                }
            }
        }

        for workload in self.repo.list_workloads(&by_state(WorkloadState::Running))? {
            let Some(handle) = &workload.handle else {
                continue;
            };
            if let Err(SubstrateError::NotFound(_)) = self.substrate.inspect(handle).await {
                if self.fail(&workload, "unit disappeared".to_string()).await {
                    report.failed += 1;
                }
            }
        }

        let retention = self.config.tombstone_retention.as_secs();
        for workload in self.repo.list_workloads(&by_state(WorkloadState::Deleted))? {
            if now.saturating_sub(workload.updated_at) > retention
                && self.repo.purge_workload(&workload.id)?
            {
                report.purged += 1;
            }
        }

        if report != ReconcileReport::default() {
            info!(failed = report.failed, purged = report.purged, "reconciliation pass");
        }
        Ok(report)
    }

    /// Rebuild in-memory state after a restart: restore quota tokens and
    /// resume work that was interrupted. Returns the number of workloads
    /// whose reservation was restored.
    pub fn recover(self: &Arc<Self>) -> LifecycleResult<usize> {
        let mut restored = 0;
        for workload in self.repo.list_workloads(&WorkloadFilter::default())? {
            match workload.state {
                WorkloadState::Failed | WorkloadState::Deleted => continue,
                WorkloadState::Stopped => {
                    let transition = Transition::to(WorkloadState::Deleted);
                    self.repo
                        .update_state(&workload.id, WorkloadState::Stopped, transition)?;
                    continue;
                }
                _ => {}
            }

            let token = self
                .quota
                .restore(&workload.owner, &workload.namespace, workload.resources);
            self.reservations().insert(workload.id.clone(), token);
            restored += 1;

            let this = Arc::clone(self);
            let state = workload.state;
            match state {
                WorkloadState::Pending => {
                    self.spawn_provision(workload.id.clone());
                }
                WorkloadState::Starting => {
                    tokio::spawn(async move { this.bring_up(workload).await });
                }
                WorkloadState::Stopping => {
                    tokio::spawn(async move {
                        if let Err(e) = this.finish_delete(&workload.id).await {
                            error!(workload_id = %workload.id, error = %e, "resumed delete failed");
                        }
                    });
                }
                WorkloadState::Running => {
                    tokio::spawn(async move { this.reattach(workload).await });
                }
                _ => {}
            }
        }
        info!(restored, "lifecycle state recovered");
        Ok(restored)
    }
}

fn by_state(state: WorkloadState) -> WorkloadFilter {
    WorkloadFilter {
        state: Some(state),
        ..Default::default()
    }
}

fn new_workload_id() -> WorkloadId {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("w-{}", &uuid[..12])
}
