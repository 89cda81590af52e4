//! Snapshot creation, restore, and deletion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};

use skiff_auth::Principal;
use skiff_core::epoch_secs;
use skiff_lifecycle::{CreateRequest, Orchestrator};
use skiff_state::{Repository, RestoreSeed, Snapshot, SnapshotId, StateError, Workload, WorkloadId};
use skiff_substrate::Substrate;

use crate::error::{SnapshotError, SnapshotResult};

/// What currently holds a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hold {
    Restoring(usize),
    Deleting,
}

pub struct SnapshotManager {
    orchestrator: Arc<Orchestrator>,
    /// One async lock per workload, so creates for it run one at a time.
    creating: Mutex<HashMap<WorkloadId, Arc<tokio::sync::Mutex<()>>>>,
    holds: Arc<Mutex<HashMap<SnapshotId, Hold>>>,
}

impl SnapshotManager {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            creating: Mutex::new(HashMap::new()),
            holds: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn creating(&self) -> MutexGuard<'_, HashMap<WorkloadId, Arc<tokio::sync::Mutex<()>>>> {
        self.creating.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn owned(&self, principal: &Principal, id: &str) -> SnapshotResult<Snapshot> {
        let snapshot = self.orchestrator.repo().get_snapshot(id)?;
        if !principal.may_act_on(&snapshot.owner) {
            return Err(SnapshotError::Forbidden(format!(
                "snapshot {id} belongs to another principal"
            )));
        }
        Ok(snapshot)
    }

    /// Checkpoint a running workload. Concurrent creates for the same
    /// workload are serialized; a non-running workload leaves no record.
    pub async fn create(&self, principal: &Principal, workload_id: &str) -> SnapshotResult<Snapshot> {
        let lock = self
            .creating()
            .entry(workload_id.to_string())
            .or_default()
            .clone();
        let result = {
            let _serial = lock.lock().await;
            self.checkpoint(principal, workload_id).await
        };

        let mut creating = self.creating();
        if Arc::strong_count(&lock) <= 2 {
            creating.remove(workload_id);
        }
        result
    }

    async fn checkpoint(&self, principal: &Principal, workload_id: &str) -> SnapshotResult<Snapshot> {
        let (workload, handle) = self.orchestrator.running(principal, workload_id)?;
        let id = new_snapshot_id();

        let substrate = self.orchestrator.substrate();
        let (handle_ref, id_ref) = (&handle, id.as_str());
        let checkpoint = self
            .orchestrator
            .retry()
            .run("checkpoint", move || substrate.checkpoint(handle_ref, id_ref))
            .await?;

        let snapshot = Snapshot {
            id,
            workload_id: workload.id.clone(),
            namespace: workload.namespace.clone(),
            owner: workload.owner.clone(),
            storage_ref: checkpoint.storage_ref,
            size_bytes: checkpoint.size_bytes,
            created_at: epoch_secs(),
        };
        if let Err(e) = self.orchestrator.repo().create_snapshot(&snapshot) {
            if let Err(cleanup) = substrate.delete_checkpoint(&snapshot.storage_ref).await {
                warn!(storage_ref = %snapshot.storage_ref, error = %cleanup, "orphaned checkpoint");
            }
            return Err(e.into());
        }

        info!(
            snapshot_id = %snapshot.id,
            %workload_id,
            size_bytes = snapshot.size_bytes,
            "snapshot created"
        );
        Ok(snapshot)
    }

    /// Admit a fresh workload seeded from a snapshot. Fields the target
    /// leaves out are taken from the source workload when it still exists.
    pub fn restore(
        &self,
        principal: &Principal,
        snapshot_id: &str,
        mut target: CreateRequest,
    ) -> SnapshotResult<Workload> {
        // Read under the hold so a delete that already finished is seen.
        let hold = RestoreHold::acquire(self.holds.clone(), snapshot_id)?;
        let snapshot = self.owned(principal, snapshot_id)?;
        if target.namespace.is_none() {
            target.namespace = Some(snapshot.namespace.clone());
        }
        if target.image.is_none() && target.template.is_none() {
            match self.orchestrator.repo().get_workload(&snapshot.workload_id) {
                Ok(source) => {
                    target.image = Some(source.spec.image);
                    target.command.get_or_insert(source.spec.command);
                    for (key, value) in source.spec.env {
                        target.env.entry(key).or_insert(value);
                    }
                    if target.resources.is_none() {
                        target.resources = Some(source.resources);
                    }
                }
                Err(StateError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let seed = RestoreSeed {
            snapshot_id: snapshot.id.clone(),
            storage_ref: snapshot.storage_ref.clone(),
        };
        let workload = self.orchestrator.admit(principal, target, Some(seed))?;
        let provisioning = self.orchestrator.spawn_provision(workload.id.clone());
        tokio::spawn(async move {
            let _ = provisioning.await;
            drop(hold);
        });

        info!(%snapshot_id, workload_id = %workload.id, "restore started");
        Ok(workload)
    }

    /// Delete a snapshot and its checkpoint data. `InUse` while a restore
    /// from it is still provisioning.
    pub async fn delete(&self, principal: &Principal, snapshot_id: &str) -> SnapshotResult<()> {
        let snapshot = self.owned(principal, snapshot_id)?;
        {
            let mut holds = lock_holds(&self.holds);
            match holds.get(snapshot_id) {
                Some(Hold::Restoring(_)) => {
                    return Err(SnapshotError::InUse(snapshot_id.to_string()));
                }
                Some(Hold::Deleting) => {
                    return Err(StateError::NotFound(format!("snapshot {snapshot_id}")).into());
                }
                None => {
                    holds.insert(snapshot_id.to_string(), Hold::Deleting);
                }
            }
        }

        let result = self.remove(&snapshot).await;
        lock_holds(&self.holds).remove(snapshot_id);
        result
    }

    async fn remove(&self, snapshot: &Snapshot) -> SnapshotResult<()> {
        self.orchestrator
            .substrate()
            .delete_checkpoint(&snapshot.storage_ref)
            .await?;
        self.orchestrator.repo().delete_snapshot(&snapshot.id)?;
        info!(snapshot_id = %snapshot.id, "snapshot deleted");
        Ok(())
    }

    pub fn get(&self, principal: &Principal, snapshot_id: &str) -> SnapshotResult<Snapshot> {
        self.owned(principal, snapshot_id)
    }

    /// Snapshots of a workload visible to the principal, oldest first.
    pub fn list(&self, principal: &Principal, workload_id: &str) -> SnapshotResult<Vec<Snapshot>> {
        let snapshots = self.orchestrator.repo().list_snapshots(workload_id)?;
        Ok(snapshots
            .into_iter()
            .filter(|s| principal.may_act_on(&s.owner))
            .collect())
    }

    /// Number of restores currently provisioning from `snapshot_id`.
    pub fn restores_in_progress(&self, snapshot_id: &str) -> usize {
        match lock_holds(&self.holds).get(snapshot_id) {
            Some(Hold::Restoring(n)) => *n,
            _ => 0,
        }
    }
}

fn lock_holds(holds: &Mutex<HashMap<SnapshotId, Hold>>) -> MutexGuard<'_, HashMap<SnapshotId, Hold>> {
    holds.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counts one in-flight restore; released on drop.
struct RestoreHold {
    holds: Arc<Mutex<HashMap<SnapshotId, Hold>>>,
    snapshot_id: SnapshotId,
}

impl RestoreHold {
    fn acquire(holds: Arc<Mutex<HashMap<SnapshotId, Hold>>>, snapshot_id: &str) -> SnapshotResult<Self> {
        {
            let mut map = lock_holds(&holds);
            let hold = map
                .entry(snapshot_id.to_string())
                .or_insert(Hold::Restoring(0));
            match hold {
                Hold::Restoring(n) => *n += 1,
                Hold::Deleting => {
                    return Err(StateError::NotFound(format!("snapshot {snapshot_id}")).into());
                }
            }
        }
        Ok(Self {
            holds,
            snapshot_id: snapshot_id.to_string(),
        })
    }
}

impl Drop for RestoreHold {
    fn drop(&mut self) {
        let mut map = lock_holds(&self.holds);
        if let Some(Hold::Restoring(n)) = map.get_mut(&self.snapshot_id) {
            *n -= 1;
            if *n == 0 {
                map.remove(&self.snapshot_id);
            }
        }
    }
}

fn new_snapshot_id() -> SnapshotId {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("snap-{}", &uuid[..12])
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use bytes::Bytes;
    use skiff_auth::Scope;
    use skiff_core::config::LifecycleConfig;
    use skiff_core::{ErrorKind, TemplateCatalog};
    use skiff_health::HealthAggregator;
    use skiff_quota::QuotaEngine;
    use skiff_state::{SecretSealer, StateStore, WorkloadState};
    use skiff_substrate::FakeSubstrate;
    use skiff_substrate::fake::Op;

    use super::*;

    struct Harness {
        snapshots: SnapshotManager,
        orch: Arc<Orchestrator>,
        store: Arc<StateStore>,
        substrate: Arc<FakeSubstrate>,
    }

    fn harness() -> Harness {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let substrate = Arc::new(FakeSubstrate::new());
        let orch = Arc::new(Orchestrator::new(
            store.clone(),
            substrate.clone(),
            Arc::new(QuotaEngine::unlimited()),
            Arc::new(HealthAggregator::new(Duration::from_secs(60))),
            Arc::new(TemplateCatalog::default()),
            Arc::new(SecretSealer::from_passphrase("test")),
            LifecycleConfig::default(),
        ));
        Harness {
            snapshots: SnapshotManager::new(orch.clone()),
            orch,
            store,
            substrate,
        }
    }

    fn principal(id: &str) -> Principal {
        Principal {
            id: id.to_string(),
            label: id.to_string(),
            scopes: BTreeSet::from([Scope::Snapshots]),
        }
    }

    fn image() -> CreateRequest {
        CreateRequest {
            image: Some("img".to_string()),
            command: Some(vec!["serve".to_string()]),
            ..Default::default()
        }
    }

    async fn wait_for(store: &StateStore, id: &str, state: WorkloadState) -> Workload {
        for _ in 0..400 {
            let workload = store.get_workload(id).unwrap();
            if workload.state == state {
                return workload;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("workload {id} never reached {state}");
    }

    async fn running(h: &Harness) -> Workload {
        let created = h.orch.create(&principal("alice"), image()).unwrap();
        wait_for(&h.store, &created.id, WorkloadState::Running).await
    }

    #[tokio::test]
    async fn create_records_checkpoint() {
        let h = harness();
        let workload = running(&h).await;

        let snapshot = h.snapshots.create(&principal("alice"), &workload.id).await.unwrap();
        assert_eq!(snapshot.workload_id, workload.id);
        assert_eq!(snapshot.storage_ref, format!("fake://{}", snapshot.id));
        assert_eq!(
            h.snapshots.list(&principal("alice"), &workload.id).unwrap(),
            vec![snapshot]
        );
        assert!(h.snapshots.list(&principal("bob"), &workload.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_on_non_running_leaves_no_record() {
        let h = harness();
        let pending = h.orch.admit(&principal("alice"), image(), None).unwrap();

        let err = h
            .snapshots
            .create(&principal("alice"), &pending.id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotRunning);
        assert!(h.snapshots.list(&principal("alice"), &pending.id).unwrap().is_empty());
        assert_eq!(h.substrate.calls(Op::Checkpoint), 0);
    }

    #[tokio::test]
    async fn concurrent_creates_run_one_at_a_time() {
        let h = harness();
        let workload = running(&h).await;
        let alice = principal("alice");
        h.substrate.set_checkpoint_delay(Duration::from_millis(30));

        let (a, b) = tokio::join!(
            h.snapshots.create(&alice, &workload.id),
            h.snapshots.create(&alice, &workload.id)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.id, b.id);
        assert_eq!(h.snapshots.list(&alice, &workload.id).unwrap().len(), 2);
        assert_eq!(h.substrate.calls(Op::Checkpoint), 2);
        assert_eq!(h.substrate.peak_checkpoints_in_flight(), 1);
        assert!(h.snapshots.creating().is_empty());
    }

    #[tokio::test]
    async fn creates_for_different_workloads_overlap() {
        let h = harness();
        let first = running(&h).await;
        let second = running(&h).await;
        let alice = principal("alice");
        h.substrate.set_checkpoint_delay(Duration::from_millis(30));

        let (a, b) = tokio::join!(
            h.snapshots.create(&alice, &first.id),
            h.snapshots.create(&alice, &second.id)
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(h.substrate.peak_checkpoints_in_flight(), 2);
    }

    #[tokio::test]
    async fn failed_checkpoint_leaves_no_record() {
        let h = harness();
        let workload = running(&h).await;
        h.substrate
            .fail_next(Op::Checkpoint, skiff_substrate::SubstrateError::Fatal("disk full".to_string()));

        let err = h
            .snapshots
            .create(&principal("alice"), &workload.id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(h.snapshots.list(&principal("alice"), &workload.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn restore_seeds_a_fresh_workload() {
        let h = harness();
        let alice = principal("alice");
        let source = running(&h).await;
        let source_handle = source.handle.clone().unwrap();
        h.substrate
            .upload(&source_handle, "/data/state.txt", Bytes::from_static(b"v1"))
            .await
            .unwrap();
        let snapshot = h.snapshots.create(&alice, &source.id).await.unwrap();

        let restored = h
            .snapshots
            .restore(&alice, &snapshot.id, CreateRequest::default())
            .unwrap();
        assert_eq!(restored.state, WorkloadState::Pending);
        assert_ne!(restored.id, source.id);
        assert_eq!(restored.spec.image, "img");
        assert_eq!(restored.spec.command, vec!["serve".to_string()]);
        assert_eq!(restored.restored_from.as_ref().unwrap().snapshot_id, snapshot.id);

        let running = wait_for(&h.store, &restored.id, WorkloadState::Running).await;
        let data = h
            .substrate
            .download(&running.handle.unwrap(), "/data/state.txt")
            .await
            .unwrap();
        assert_eq!(data, Bytes::from_static(b"v1"));

        // Source and snapshot untouched.
        assert_eq!(h.store.get_workload(&source.id).unwrap(), source);
        assert_eq!(h.store.get_snapshot(&snapshot.id).unwrap(), snapshot);
    }

    #[tokio::test]
    async fn delete_is_blocked_while_restoring() {
        let h = harness();
        let alice = principal("alice");
        let source = running(&h).await;
        let snapshot = h.snapshots.create(&alice, &source.id).await.unwrap();

        h.substrate.set_provision_delay(Duration::from_millis(150));
        let restored = h
            .snapshots
            .restore(&alice, &snapshot.id, CreateRequest::default())
            .unwrap();
        assert_eq!(h.snapshots.restores_in_progress(&snapshot.id), 1);

        let err = h.snapshots.delete(&alice, &snapshot.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InUse);

        wait_for(&h.store, &restored.id, WorkloadState::Running).await;
        for _ in 0..100 {
            if h.snapshots.restores_in_progress(&snapshot.id) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        h.snapshots.delete(&alice, &snapshot.id).await.unwrap();
        let err = h.snapshots.get(&alice, &snapshot.id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restore_and_delete_never_both_win() {
        let h = Arc::new(harness());
        let source = running(&h).await;

        for _ in 0..25 {
            let snapshot = h.snapshots.create(&principal("alice"), &source.id).await.unwrap();
            let restorer = {
                let h = h.clone();
                let id = snapshot.id.clone();
                tokio::spawn(async move {
                    h.snapshots
                        .restore(&principal("alice"), &id, CreateRequest::default())
                        .is_ok()
                })
            };
            let deleter = {
                let h = h.clone();
                let id = snapshot.id.clone();
                tokio::spawn(async move { h.snapshots.delete(&principal("alice"), &id).await.is_ok() })
            };
            let (restored, deleted) = (restorer.await.unwrap(), deleter.await.unwrap());
            assert!(!(restored && deleted), "restore started from a deleted snapshot");
        }
    }

    #[tokio::test]
    async fn restore_after_delete_is_not_found() {
        let h = harness();
        let alice = principal("alice");
        let source = running(&h).await;
        let snapshot = h.snapshots.create(&alice, &source.id).await.unwrap();
        h.snapshots.delete(&alice, &snapshot.id).await.unwrap();

        let err = h
            .snapshots
            .restore(&alice, &snapshot.id, CreateRequest::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(h.snapshots.restores_in_progress(&snapshot.id), 0);
        assert!(lock_holds(&h.snapshots.holds).is_empty());
    }

    #[tokio::test]
    async fn foreign_snapshots_are_forbidden() {
        let h = harness();
        let source = running(&h).await;
        let snapshot = h.snapshots.create(&principal("alice"), &source.id).await.unwrap();

        let err = h
            .snapshots
            .restore(&principal("bob"), &snapshot.id, CreateRequest::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        let err = h.snapshots.delete(&principal("bob"), &snapshot.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let err = h
            .snapshots
            .create(&principal("bob"), &source.id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn restore_unknown_snapshot_is_not_found() {
        let h = harness();
        let err = h
            .snapshots
            .restore(&principal("alice"), "snap-missing", CreateRequest::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
