//! Assembly of the Skiff control plane.
//!
//! `main.rs` parses the command line and installs logging; everything that
//! wires subsystems together lives here so integration tests can build the
//! same stack against a fake substrate.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use skiff_api::ApiState;
use skiff_auth::AuthGate;
use skiff_core::config::SecretsConfig;
use skiff_core::{SkiffConfig, TemplateCatalog, epoch_secs};
use skiff_health::{HealthAggregator, ProbeMonitor};
use skiff_lifecycle::{Namespaces, Orchestrator};
use skiff_quota::{QuotaEngine, QuotaSubject};
use skiff_session::{CloseReason, SessionManager};
use skiff_snapshot::SnapshotManager;
use skiff_state::{Repository, SecretSealer, StateStore};
use skiff_substrate::{LocalSubstrate, Substrate};

/// Open the repository named by `[storage]`.
pub fn open_store(config: &SkiffConfig) -> anyhow::Result<Arc<StateStore>> {
    if config.storage.in_memory {
        warn!("in-memory storage: workload records are lost on exit");
        return Ok(Arc::new(StateStore::open_in_memory()?));
    }
    std::fs::create_dir_all(&config.storage.data_dir).with_context(|| {
        format!("creating data dir {}", config.storage.data_dir.display())
    })?;
    let path = config.storage.data_dir.join("skiff.redb");
    let store = StateStore::open(&path)?;
    info!(path = ?path, "state store opened");
    Ok(Arc::new(store))
}

/// Secret sealer keyed from the configured environment variable, or a
/// per-process key when it is unset.
pub fn secret_sealer(config: &SecretsConfig) -> anyhow::Result<SecretSealer> {
    match std::env::var(&config.master_key_env) {
        Ok(passphrase) if !passphrase.trim().is_empty() => {
            Ok(SecretSealer::from_passphrase(&passphrase))
        }
        _ => {
            warn!(
                env = %config.master_key_env,
                "master key unset; secrets stored now will be unreadable after a restart"
            );
            Ok(SecretSealer::ephemeral()?)
        }
    }
}

/// Load ceilings set through the admin API back into `quota`.
pub fn restore_ceilings(quota: &QuotaEngine, repo: &dyn Repository) -> anyhow::Result<usize> {
    let mut restored = 0;
    for stored in repo.list_ceilings()? {
        match QuotaSubject::from_parts(&stored.kind, stored.id.as_str()) {
            Some(subject) => {
                quota.set_ceiling(subject, stored.ceiling);
                restored += 1;
            }
            None => warn!(kind = %stored.kind, id = %stored.id, "skipping ceiling with unknown subject kind"),
        }
    }
    Ok(restored)
}

/// Wire every subsystem around `store` and `substrate`.
pub fn assemble(
    config: &SkiffConfig,
    store: Arc<StateStore>,
    substrate: Arc<dyn Substrate>,
) -> anyhow::Result<ApiState> {
    let auth = AuthGate::persistent(store.clone())?;
    auth.install_bootstrap(&config.auth)?;
    let auth = Arc::new(auth);
    let quota = QuotaEngine::new(&config.quotas);
    let restored = restore_ceilings(&quota, store.as_ref())?;
    if restored > 0 {
        info!(restored, "quota ceilings restored");
    }
    let sealer = Arc::new(secret_sealer(&config.secrets)?);
    let health = Arc::new(HealthAggregator::new(config.health.staleness_window));
    let templates = Arc::new(TemplateCatalog::new(config.templates.clone()));
    info!(templates = templates.len(), "template catalog loaded");

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        substrate,
        Arc::new(quota),
        health.clone(),
        templates,
        sealer.clone(),
        config.lifecycle.clone(),
    ));
    let sessions = Arc::new(SessionManager::new(
        orchestrator.clone(),
        config.sessions.clone(),
    ));
    let snapshots = Arc::new(SnapshotManager::new(orchestrator.clone()));

    Ok(ApiState {
        auth,
        namespaces: Arc::new(Namespaces::new(store, sealer)),
        orchestrator,
        sessions,
        snapshots,
        health,
        started_at: Instant::now(),
    })
}

/// Periodic reconciliation: stuck starts, vanished units, old tombstones.
pub fn spawn_reconciler(
    orchestrator: Arc<Orchestrator>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let every = orchestrator.config().reconcile_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match orchestrator.reconcile(epoch_secs()).await {
                        Ok(report) if report.failed > 0 || report.purged > 0 => {
                            info!(failed = report.failed, purged = report.purged, "reconcile pass");
                        }
                        Ok(_) => debug!("reconcile pass: nothing to do"),
                        Err(e) => warn!(error = %e, "reconcile pass failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

/// Run the daemon until interrupted.
pub async fn run(config: SkiffConfig) -> anyhow::Result<()> {
    info!("Skiff daemon starting");

    let store = open_store(&config)?;
    let root = config.substrate_root();
    let substrate = Arc::new(LocalSubstrate::new(&root)?);
    info!(root = ?root, "local substrate ready");

    let state = assemble(&config, store, substrate)?;
    let resumed = state.orchestrator.recover()?;
    info!(resumed, "workloads recovered");

    // ── Background tasks ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = spawn_reconciler(state.orchestrator.clone(), shutdown_rx);

    let probes = ProbeMonitor::new(state.health.clone(), &config.health);
    for target in &config.health.probes {
        probes.start_monitor(target).await;
    }
    if !config.health.probes.is_empty() {
        info!(targets = config.health.probes.len(), "machine probes started");
    }

    // ── API server ─────────────────────────────────────────────

    let router = skiff_api::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(config.server.listen)
        .await
        .with_context(|| format!("binding {}", config.server.listen))?;
    info!(addr = %config.server.listen, "API server listening");

    let sessions = state.sessions.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
            // Streaming responses only end once their sessions do.
            let closed = sessions
                .registry()
                .close_everything(CloseReason::Shutdown)
                .await;
            info!(sessions = closed, "sessions closed");
        })
        .await?;

    probes.stop_all().await;
    let _ = reconciler.await;

    info!("Skiff daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
