//! StateStore: redb-backed implementation of [`Repository`].
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing and `--in-memory` daemons).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use skiff_core::epoch_secs;

use crate::error::{StateError, StateResult};
use crate::repository::Repository;
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
        txn.open_table(NAMESPACES).map_err(map_err!(Table))?;
        txn.open_table(SECRETS).map_err(map_err!(Table))?;
        txn.open_table(SNAPSHOTS).map_err(map_err!(Table))?;
        txn.open_table(API_KEYS).map_err(map_err!(Table))?;
        txn.open_table(CEILINGS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn read<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(
        &self,
        table: Table,
        mut keep: impl FnMut(&str, &T) -> bool,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let item: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if keep(key.value(), &item) {
                results.push(item);
            }
        }
        Ok(results)
    }

    /// Insert `value` under `key`, failing if the key is already present.
    fn insert_new<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            if table.get(key).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(key.to_string()));
            }
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn upsert<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn remove(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }
}

impl Repository for StateStore {
    // ── Workloads ──────────────────────────────────────────────────

    fn create_workload(&self, workload: &Workload) -> StateResult<()> {
        self.insert_new(WORKLOADS, &workload.id, workload)?;
        debug!(id = %workload.id, namespace = %workload.namespace, "workload stored");
        Ok(())
    }

    fn get_workload(&self, id: &str) -> StateResult<Workload> {
        self.read(WORKLOADS, id)?
            .ok_or_else(|| StateError::NotFound(format!("workload {id}")))
    }

    fn list_workloads(&self, filter: &WorkloadFilter) -> StateResult<Vec<Workload>> {
        let mut workloads = self.scan(WORKLOADS, |_, w: &Workload| filter.matches(w))?;
        workloads.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(workloads)
    }

    fn update_state(
        &self,
        id: &str,
        expected: WorkloadState,
        transition: Transition,
    ) -> StateResult<Workload> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let workload;
        {
            let mut table = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
            let mut current: Workload = match table.get(id).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(format!("workload {id}"))),
            };
            if current.state != expected {
                return Err(StateError::Conflict {
                    id: id.to_string(),
                    expected,
                    actual: current.state,
                });
            }
            current.apply(transition, epoch_secs())?;
            let bytes = serde_json::to_vec(&current).map_err(map_err!(Serialize))?;
            table
                .insert(id, bytes.as_slice())
                .map_err(map_err!(Write))?;
            workload = current;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%id, from = %expected, to = %workload.state, "workload transitioned");
        Ok(workload)
    }

    fn purge_workload(&self, id: &str) -> StateResult<bool> {
        let existed = self.remove(WORKLOADS, id)?;
        debug!(%id, existed, "workload purged");
        Ok(existed)
    }

    // ── Namespaces ─────────────────────────────────────────────────

    fn create_namespace(&self, namespace: &Namespace) -> StateResult<()> {
        self.insert_new(NAMESPACES, &namespace.name, namespace)?;
        debug!(name = %namespace.name, "namespace stored");
        Ok(())
    }

    fn ensure_namespace(&self, namespace: &Namespace) -> StateResult<Namespace> {
        match self.insert_new(NAMESPACES, &namespace.name, namespace) {
            Ok(()) => Ok(namespace.clone()),
            Err(StateError::AlreadyExists(_)) => self.get_namespace(&namespace.name),
            Err(e) => Err(e),
        }
    }

    fn get_namespace(&self, name: &str) -> StateResult<Namespace> {
        self.read(NAMESPACES, name)?
            .ok_or_else(|| StateError::NotFound(format!("namespace {name}")))
    }

    fn list_namespaces(&self) -> StateResult<Vec<Namespace>> {
        self.scan(NAMESPACES, |_, _: &Namespace| true)
    }

    fn set_namespace_policy(&self, name: &str, policy: ResourcePolicy) -> StateResult<Namespace> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let namespace;
        {
            let mut table = txn.open_table(NAMESPACES).map_err(map_err!(Table))?;
            let mut current: Namespace = match table.get(name).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(format!("namespace {name}"))),
            };
            current.policy = policy;
            let bytes = serde_json::to_vec(&current).map_err(map_err!(Serialize))?;
            table
                .insert(name, bytes.as_slice())
                .map_err(map_err!(Write))?;
            namespace = current;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(namespace)
    }

    fn delete_namespace(&self, name: &str) -> StateResult<()> {
        let prefix = secret_key(name, "");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let workloads = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
            for entry in workloads.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let workload: Workload =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if workload.namespace == name && workload.state != WorkloadState::Deleted {
                    return Err(StateError::NotEmpty(format!("namespace {name}")));
                }
            }

            let mut namespaces = txn.open_table(NAMESPACES).map_err(map_err!(Table))?;
            if namespaces.remove(name).map_err(map_err!(Write))?.is_none() {
                return Err(StateError::NotFound(format!("namespace {name}")));
            }

            let mut secrets = txn.open_table(SECRETS).map_err(map_err!(Table))?;
            let keys: Vec<String> = secrets
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(&prefix).then_some(k)
                })
                .collect();
            for key in &keys {
                secrets.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%name, "namespace deleted");
        Ok(())
    }

    // ── Secrets ────────────────────────────────────────────────────

    fn put_secret(&self, namespace: &str, key: &str, sealed: Vec<u8>) -> StateResult<SecretInfo> {
        let table_key = secret_key(namespace, key);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let secret;
        {
            let namespaces = txn.open_table(NAMESPACES).map_err(map_err!(Table))?;
            if namespaces.get(namespace).map_err(map_err!(Read))?.is_none() {
                return Err(StateError::NotFound(format!("namespace {namespace}")));
            }

            let mut table = txn.open_table(SECRETS).map_err(map_err!(Table))?;
            let previous = match table.get(table_key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    let old: Secret =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    old.version
                }
                None => 0,
            };
            secret = Secret {
                namespace: namespace.to_string(),
                key: key.to_string(),
                sealed,
                version: previous + 1,
                updated_at: epoch_secs(),
            };
            let bytes = serde_json::to_vec(&secret).map_err(map_err!(Serialize))?;
            table
                .insert(table_key.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%namespace, %key, version = secret.version, "secret stored");
        Ok(secret.info())
    }

    fn get_secret(&self, namespace: &str, key: &str) -> StateResult<Secret> {
        let table_key = secret_key(namespace, key);
        self.read(SECRETS, &table_key)?
            .ok_or_else(|| StateError::NotFound(format!("secret {table_key}")))
    }

    fn list_secrets(&self, namespace: &str) -> StateResult<Vec<SecretInfo>> {
        let prefix = secret_key(namespace, "");
        let secrets = self.scan(SECRETS, |k, _: &Secret| k.starts_with(&prefix))?;
        Ok(secrets.iter().map(Secret::info).collect())
    }

    fn delete_secret(&self, namespace: &str, key: &str) -> StateResult<()> {
        let table_key = secret_key(namespace, key);
        if !self.remove(SECRETS, &table_key)? {
            return Err(StateError::NotFound(format!("secret {table_key}")));
        }
        debug!(%namespace, %key, "secret deleted");
        Ok(())
    }

    // ── Snapshots ──────────────────────────────────────────────────

    fn create_snapshot(&self, snapshot: &Snapshot) -> StateResult<()> {
        self.insert_new(SNAPSHOTS, &snapshot.id, snapshot)?;
        debug!(id = %snapshot.id, workload = %snapshot.workload_id, "snapshot stored");
        Ok(())
    }

    fn get_snapshot(&self, id: &str) -> StateResult<Snapshot> {
        self.read(SNAPSHOTS, id)?
            .ok_or_else(|| StateError::NotFound(format!("snapshot {id}")))
    }

    fn list_snapshots(&self, workload_id: &str) -> StateResult<Vec<Snapshot>> {
        let mut snapshots = self.scan(SNAPSHOTS, |_, s: &Snapshot| s.workload_id == workload_id)?;
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(snapshots)
    }

    fn delete_snapshot(&self, id: &str) -> StateResult<()> {
        if !self.remove(SNAPSHOTS, id)? {
            return Err(StateError::NotFound(format!("snapshot {id}")));
        }
        debug!(%id, "snapshot deleted");
        Ok(())
    }

    fn create_api_key(&self, key: &StoredApiKey) -> StateResult<()> {
        self.insert_new(API_KEYS, &key.id, key)?;
        debug!(id = %key.id, label = %key.label, "api key stored");
        Ok(())
    }

    fn list_api_keys(&self) -> StateResult<Vec<StoredApiKey>> {
        let mut keys = self.scan(API_KEYS, |_, _: &StoredApiKey| true)?;
        keys.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(keys)
    }

    fn delete_api_key(&self, id: &str) -> StateResult<()> {
        if !self.remove(API_KEYS, id)? {
            return Err(StateError::NotFound(format!("api key {id}")));
        }
        debug!(%id, "api key deleted");
        Ok(())
    }

    fn put_ceiling(&self, ceiling: &StoredCeiling) -> StateResult<()> {
        self.upsert(CEILINGS, &ceiling.table_key(), ceiling)?;
        debug!(kind = %ceiling.kind, id = %ceiling.id, "ceiling stored");
        Ok(())
    }

    fn list_ceilings(&self) -> StateResult<Vec<StoredCeiling>> {
        self.scan(CEILINGS, |_, _: &StoredCeiling| true)
    }

    fn delete_ceiling(&self, kind: &str, id: &str) -> StateResult<bool> {
        self.remove(CEILINGS, &ceiling_key(kind, id))
    }

    fn health_check(&self) -> StateResult<()> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use skiff_core::{Ceiling, ResourceRequest, SubstrateHandle};

    use super::*;

    fn test_workload(id: &str, namespace: &str) -> Workload {
        Workload {
            id: id.to_string(),
            namespace: namespace.to_string(),
            owner: "key-1".to_string(),
            spec: WorkloadSpec {
                image: "python:3.12-slim".to_string(),
                command: vec!["python".to_string(), "-m".to_string(), "http.server".to_string()],
                env: HashMap::new(),
                secrets: Vec::new(),
                template: None,
            },
            resources: ResourceRequest::new(500, 256, 0),
            state: WorkloadState::Pending,
            handle: None,
            failure: None,
            restored_from: None,
            created_at: 1_700_000_000,
            updated_at: 1_700_000_000,
        }
    }

    fn test_namespace(name: &str) -> Namespace {
        Namespace {
            name: name.to_string(),
            owner: "key-1".to_string(),
            policy: ResourcePolicy::default(),
            created_at: 1_700_000_000,
        }
    }

    fn test_snapshot(id: &str, workload_id: &str, created_at: u64) -> Snapshot {
        Snapshot {
            id: id.to_string(),
            workload_id: workload_id.to_string(),
            namespace: "default".to_string(),
            owner: "key-1".to_string(),
            storage_ref: format!("checkpoints/{id}"),
            size_bytes: 4096,
            created_at,
        }
    }

    fn start(store: &StateStore, id: &str) -> Workload {
        store
            .update_state(
                id,
                WorkloadState::Pending,
                Transition::to(WorkloadState::Starting)
                    .with_handle(SubstrateHandle::for_workload("skiff", id)),
            )
            .unwrap()
    }

    // ── Workloads ──────────────────────────────────────────────────

    #[test]
    fn workload_create_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_workload(&test_workload("w-1", "default")).unwrap();

        let w = store.get_workload("w-1").unwrap();
        assert_eq!(w.state, WorkloadState::Pending);
        assert_eq!(w.resources.memory_mb, 256);
    }

    #[test]
    fn workload_create_rejects_duplicate_id() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_workload(&test_workload("w-1", "default")).unwrap();
        let err = store.create_workload(&test_workload("w-1", "default")).unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists(_)));
    }

    #[test]
    fn workload_get_nonexistent_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.get_workload("nope").unwrap_err();
        assert_eq!(err.kind(), skiff_core::ErrorKind::NotFound);
    }

    #[test]
    fn update_state_records_handle() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_workload(&test_workload("w-1", "default")).unwrap();

        let w = start(&store, "w-1");
        assert_eq!(w.state, WorkloadState::Starting);
        assert_eq!(w.handle.as_ref().map(|h| h.as_str()), Some("skiff-w-1"));

        let stored = store.get_workload("w-1").unwrap();
        assert_eq!(stored, w);
    }

    #[test]
    fn update_state_with_stale_expectation_conflicts() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_workload(&test_workload("w-1", "default")).unwrap();
        start(&store, "w-1");

        let err = store
            .update_state(
                "w-1",
                WorkloadState::Pending,
                Transition::to(WorkloadState::Deleted),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            StateError::Conflict {
                actual: WorkloadState::Starting,
                ..
            }
        ));
        assert_eq!(store.get_workload("w-1").unwrap().state, WorkloadState::Starting);
    }

    #[test]
    fn update_state_rejects_illegal_transition() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_workload(&test_workload("w-1", "default")).unwrap();
        let err = store
            .update_state(
                "w-1",
                WorkloadState::Pending,
                Transition::to(WorkloadState::Running),
            )
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
    }

    #[test]
    fn concurrent_cas_has_single_winner() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_workload(&test_workload("w-1", "default")).unwrap();
        start(&store, "w-1");
        store
            .update_state("w-1", WorkloadState::Starting, Transition::to(WorkloadState::Running))
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .update_state(
                            "w-1",
                            WorkloadState::Running,
                            Transition::to(WorkloadState::Stopping),
                        )
                        .is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn list_workloads_filters_and_orders() {
        let store = StateStore::open_in_memory().unwrap();
        let mut a = test_workload("w-a", "team-a");
        a.created_at = 30;
        let mut b = test_workload("w-b", "team-b");
        b.created_at = 10;
        let mut c = test_workload("w-c", "team-a");
        c.created_at = 20;
        c.owner = "key-2".to_string();
        for w in [&a, &b, &c] {
            store.create_workload(w).unwrap();
        }

        let all = store.list_workloads(&WorkloadFilter::default()).unwrap();
        let ids: Vec<_> = all.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, ["w-b", "w-c", "w-a"]);

        let team_a = store
            .list_workloads(&WorkloadFilter {
                namespace: Some("team-a".to_string()),
                owner: Some("key-1".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(team_a.len(), 1);
        assert_eq!(team_a[0].id, "w-a");
    }

    #[test]
    fn deleted_workloads_are_tombstones() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_workload(&test_workload("w-1", "default")).unwrap();
        store
            .update_state("w-1", WorkloadState::Pending, Transition::to(WorkloadState::Deleted))
            .unwrap();

        assert!(store.list_workloads(&WorkloadFilter::default()).unwrap().is_empty());
        assert_eq!(store.get_workload("w-1").unwrap().state, WorkloadState::Deleted);
        assert!(store.purge_workload("w-1").unwrap());
        assert!(!store.purge_workload("w-1").unwrap());
    }

    // ── Namespaces ─────────────────────────────────────────────────

    #[test]
    fn namespace_create_get_list() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_namespace(&test_namespace("team-a")).unwrap();
        store.create_namespace(&test_namespace("team-b")).unwrap();

        assert_eq!(store.get_namespace("team-a").unwrap().owner, "key-1");
        assert_eq!(store.list_namespaces().unwrap().len(), 2);
        assert!(matches!(
            store.create_namespace(&test_namespace("team-a")),
            Err(StateError::AlreadyExists(_))
        ));
    }

    #[test]
    fn ensure_namespace_keeps_existing_record() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_namespace(&test_namespace("team-a")).unwrap();

        let mut other = test_namespace("team-a");
        other.owner = "key-2".to_string();
        let stored = store.ensure_namespace(&other).unwrap();
        assert_eq!(stored.owner, "key-1");
    }

    #[test]
    fn namespace_policy_update() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_namespace(&test_namespace("team-a")).unwrap();
        let policy = ResourcePolicy {
            default_request: Some(ResourceRequest::new(250, 128, 0)),
            max_per_workload: Some(ResourceRequest::new(2000, 4096, 1)),
        };
        let ns = store.set_namespace_policy("team-a", policy).unwrap();
        assert_eq!(ns.policy, policy);
        assert!(store.set_namespace_policy("nope", policy).is_err());
    }

    #[test]
    fn namespace_delete_refuses_while_workloads_live() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_namespace(&test_namespace("team-a")).unwrap();
        store.create_workload(&test_workload("w-1", "team-a")).unwrap();

        let err = store.delete_namespace("team-a").unwrap_err();
        assert_eq!(err.kind(), skiff_core::ErrorKind::InUse);

        store
            .update_state("w-1", WorkloadState::Pending, Transition::to(WorkloadState::Deleted))
            .unwrap();
        store.delete_namespace("team-a").unwrap();
        assert!(store.get_namespace("team-a").is_err());
    }

    #[test]
    fn namespace_delete_removes_its_secrets() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_namespace(&test_namespace("team-a")).unwrap();
        store.create_namespace(&test_namespace("team-ab")).unwrap();
        store.put_secret("team-a", "token", vec![1, 2, 3]).unwrap();
        store.put_secret("team-ab", "token", vec![4, 5, 6]).unwrap();

        store.delete_namespace("team-a").unwrap();
        assert!(store.list_secrets("team-a").unwrap().is_empty());
        assert_eq!(store.list_secrets("team-ab").unwrap().len(), 1);
    }

    // ── Secrets ────────────────────────────────────────────────────

    #[test]
    fn secret_versions_increment() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_namespace(&test_namespace("team-a")).unwrap();

        assert_eq!(store.put_secret("team-a", "db", vec![1]).unwrap().version, 1);
        assert_eq!(store.put_secret("team-a", "db", vec![2]).unwrap().version, 2);
        let secret = store.get_secret("team-a", "db").unwrap();
        assert_eq!(secret.sealed, vec![2]);
        assert_eq!(secret.version, 2);
    }

    #[test]
    fn secret_requires_namespace() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.put_secret("ghost", "db", vec![1]).unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn secret_list_and_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_namespace(&test_namespace("team-a")).unwrap();
        store.put_secret("team-a", "a", vec![1]).unwrap();
        store.put_secret("team-a", "b", vec![1]).unwrap();

        let keys: Vec<_> = store
            .list_secrets("team-a")
            .unwrap()
            .into_iter()
            .map(|s| s.key)
            .collect();
        assert_eq!(keys, ["a", "b"]);

        store.delete_secret("team-a", "a").unwrap();
        assert!(store.delete_secret("team-a", "a").is_err());
        assert_eq!(store.list_secrets("team-a").unwrap().len(), 1);
    }

    // ── Snapshots ──────────────────────────────────────────────────

    #[test]
    fn snapshot_records_are_create_only() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_snapshot(&test_snapshot("s-1", "w-1", 10)).unwrap();
        assert!(matches!(
            store.create_snapshot(&test_snapshot("s-1", "w-1", 20)),
            Err(StateError::AlreadyExists(_))
        ));
        assert_eq!(store.get_snapshot("s-1").unwrap().created_at, 10);
    }

    #[test]
    fn snapshots_listed_per_workload_oldest_first() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_snapshot(&test_snapshot("s-2", "w-1", 20)).unwrap();
        store.create_snapshot(&test_snapshot("s-1", "w-1", 10)).unwrap();
        store.create_snapshot(&test_snapshot("s-3", "w-2", 5)).unwrap();

        let ids: Vec<_> = store
            .list_snapshots("w-1")
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, ["s-1", "s-2"]);

        store.delete_snapshot("s-1").unwrap();
        assert!(matches!(store.delete_snapshot("s-1"), Err(StateError::NotFound(_))));
    }

    // ── API keys and ceilings ──────────────────────────────────────

    fn stored_key(id: &str, created_at: u64) -> StoredApiKey {
        StoredApiKey {
            id: id.to_string(),
            label: "ci".to_string(),
            scopes: vec!["workloads".to_string()],
            digest: "ab".repeat(32),
            created_at,
        }
    }

    #[test]
    fn api_key_create_list_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_api_key(&stored_key("key-b", 20)).unwrap();
        store.create_api_key(&stored_key("key-a", 10)).unwrap();
        assert!(matches!(
            store.create_api_key(&stored_key("key-a", 30)),
            Err(StateError::AlreadyExists(_))
        ));

        let ids: Vec<_> = store.list_api_keys().unwrap().into_iter().map(|k| k.id).collect();
        assert_eq!(ids, vec!["key-a", "key-b"]);

        store.delete_api_key("key-a").unwrap();
        assert!(matches!(store.delete_api_key("key-a"), Err(StateError::NotFound(_))));
        assert_eq!(store.list_api_keys().unwrap().len(), 1);
    }

    #[test]
    fn ceiling_put_replaces_and_delete_reports() {
        let store = StateStore::open_in_memory().unwrap();
        let mut ceiling = StoredCeiling {
            kind: "principal".to_string(),
            id: "key-1".to_string(),
            ceiling: Ceiling::workloads(1),
        };
        store.put_ceiling(&ceiling).unwrap();
        ceiling.ceiling = Ceiling::workloads(3);
        store.put_ceiling(&ceiling).unwrap();

        let stored = store.list_ceilings().unwrap();
        assert_eq!(stored, vec![ceiling]);

        assert!(store.delete_ceiling("principal", "key-1").unwrap());
        assert!(!store.delete_ceiling("principal", "key-1").unwrap());
        assert!(store.list_ceilings().unwrap().is_empty());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("skiff.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.create_workload(&test_workload("w-1", "default")).unwrap();
            start(&store, "w-1");
        }

        {
            let store = StateStore::open(&db_path).unwrap();
            store.create_api_key(&stored_key("key-1", 1)).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let w = store.get_workload("w-1").unwrap();
        assert_eq!(w.state, WorkloadState::Starting);
        assert_eq!(store.list_api_keys().unwrap()[0].id, "key-1");
        assert!(w.handle.is_some());
        store.health_check().unwrap();
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.list_workloads(&WorkloadFilter::default()).unwrap().is_empty());
        assert!(store.list_namespaces().unwrap().is_empty());
        assert!(store.list_secrets("any").unwrap().is_empty());
        assert!(store.list_snapshots("any").unwrap().is_empty());
        assert!(!store.purge_workload("nope").unwrap());
    }
}
