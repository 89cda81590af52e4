//! Per-workload registry of open sessions.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use skiff_core::epoch_secs;
use skiff_lifecycle::SessionCloser;

use crate::frame::{CloseReason, SessionKind};

pub type SessionId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub workload_id: String,
    pub kind: SessionKind,
    pub opened_at: u64,
}

struct Entry {
    info: SessionInfo,
    close: watch::Sender<Option<CloseReason>>,
}

/// Sessions grouped by workload id.
///
/// Each session task holds the only receiver of its close signal, so the
/// signal's sender observes `closed()` exactly when the task has finished
/// and released its substrate channel.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, HashMap<SessionId, Entry>>>,
    close_grace: Duration,
}

impl SessionRegistry {
    pub fn new(close_grace: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            close_grace,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashMap<SessionId, Entry>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn close_grace(&self) -> Duration {
        self.close_grace
    }

    /// Register a new session. Dropping the returned registration removes it.
    pub fn register(self: &Arc<Self>, workload_id: &str, kind: SessionKind) -> Registration {
        let id = format!("s-{}", uuid::Uuid::new_v4().simple());
        let (close, closed) = watch::channel(None);
        let info = SessionInfo {
            id: id.clone(),
            workload_id: workload_id.to_string(),
            kind,
            opened_at: epoch_secs(),
        };
        self.lock()
            .entry(workload_id.to_string())
            .or_default()
            .insert(id.clone(), Entry { info, close });
        debug!(session_id = %id, %workload_id, kind = kind.as_str(), "session registered");
        Registration {
            registry: Arc::clone(self),
            workload_id: workload_id.to_string(),
            id,
            closed,
        }
    }

    fn deregister(&self, workload_id: &str, id: &str) {
        let mut sessions = self.lock();
        if let Some(entries) = sessions.get_mut(workload_id) {
            entries.remove(id);
            if entries.is_empty() {
                sessions.remove(workload_id);
            }
        }
    }

    pub fn list(&self, workload_id: &str) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .lock()
            .get(workload_id)
            .map(|entries| entries.values().map(|e| e.info.clone()).collect())
            .unwrap_or_default();
        infos.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then(a.id.cmp(&b.id)));
        infos
    }

    /// Open sessions per kind, every kind present.
    pub fn counts(&self) -> BTreeMap<SessionKind, usize> {
        let mut counts: BTreeMap<SessionKind, usize> =
            SessionKind::ALL.iter().map(|k| (*k, 0)).collect();
        for entries in self.lock().values() {
            for entry in entries.values() {
                *counts.entry(entry.info.kind).or_default() += 1;
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal every session of a workload and wait (up to the grace period
    /// each, in parallel) for them to release their channels. Returns how
    /// many sessions were signalled; a second call finds none.
    pub async fn close_workload(&self, workload_id: &str, reason: CloseReason) -> usize {
        let entries: Vec<Entry> = self
            .lock()
            .remove(workload_id)
            .map(|entries| entries.into_values().collect())
            .unwrap_or_default();
        if entries.is_empty() {
            return 0;
        }

        for entry in &entries {
            let _ = entry.close.send(Some(reason));
        }
        let grace = self.close_grace;
        let waits = entries.iter().map(|entry| async move {
            if tokio::time::timeout(grace, entry.close.closed()).await.is_err() {
                warn!(session_id = %entry.info.id, "session did not close within grace period");
            }
        });
        join_all(waits).await;

        info!(%workload_id, sessions = entries.len(), ?reason, "sessions closed");
        entries.len()
    }

    /// Close every session of every workload.
    pub async fn close_everything(&self, reason: CloseReason) -> usize {
        let workloads: Vec<String> = self.lock().keys().cloned().collect();
        let mut closed = 0;
        for workload_id in workloads {
            closed += self.close_workload(&workload_id, reason).await;
        }
        closed
    }
}

#[async_trait]
impl SessionCloser for SessionRegistry {
    async fn close_all(&self, workload_id: &str) {
        self.close_workload(workload_id, CloseReason::WorkloadUnavailable)
            .await;
    }
}

/// A live registry entry, owned by the session's task.
pub struct Registration {
    registry: Arc<SessionRegistry>,
    workload_id: String,
    id: SessionId,
    closed: watch::Receiver<Option<CloseReason>>,
}

impl Registration {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The close reason, once one was signalled.
    pub fn reason(&self) -> Option<CloseReason> {
        *self.closed.borrow()
    }

    /// Resolve when the session is told to close.
    pub async fn signalled(&mut self) -> CloseReason {
        loop {
            if let Some(reason) = *self.closed.borrow_and_update() {
                return reason;
            }
            if self.closed.changed().await.is_err() {
                return CloseReason::Shutdown;
            }
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.deregister(&self.workload_id, &self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(Duration::from_millis(200)))
    }

    #[test]
    fn dropping_registration_deregisters() {
        let registry = registry();
        let a = registry.register("w-1", SessionKind::Exec);
        let _b = registry.register("w-1", SessionKind::LogStream);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.list("w-1").len(), 2);

        drop(a);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.counts()[&SessionKind::LogStream], 1);
        assert_eq!(registry.counts()[&SessionKind::Exec], 0);
    }

    #[tokio::test]
    async fn close_waits_for_tasks_and_is_idempotent() {
        let registry = registry();
        let mut registration = registry.register("w-1", SessionKind::Exec);
        let task = tokio::spawn(async move {
            let reason = registration.signalled().await;
            drop(registration);
            reason
        });

        assert_eq!(
            registry
                .close_workload("w-1", CloseReason::WorkloadUnavailable)
                .await,
            1
        );
        assert_eq!(task.await.unwrap(), CloseReason::WorkloadUnavailable);
        assert!(registry.is_empty());
        assert_eq!(
            registry
                .close_workload("w-1", CloseReason::WorkloadUnavailable)
                .await,
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_session_is_abandoned_after_grace() {
        let registry = registry();
        let registration = registry.register("w-1", SessionKind::Connect);
        // Nobody listens; close still returns once the grace period passes.
        assert_eq!(registry.close_workload("w-1", CloseReason::Shutdown).await, 1);
        assert_eq!(registration.reason(), Some(CloseReason::Shutdown));
    }

    #[tokio::test]
    async fn other_workloads_are_untouched() {
        let registry = registry();
        let _a = registry.register("w-1", SessionKind::Exec);
        let b = registry.register("w-2", SessionKind::Exec);
        drop(b);
        let _c = registry.register("w-2", SessionKind::Exec);

        registry.close_all("w-1").await;
        assert_eq!(registry.list("w-2").len(), 1);
    }
}
