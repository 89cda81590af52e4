//! Namespace and secret management.

use std::sync::Arc;

use tracing::info;

use skiff_auth::Principal;
use skiff_core::epoch_secs;
use skiff_state::{Namespace, Repository, ResourcePolicy, SecretInfo, SecretSealer};

use crate::error::{LifecycleError, LifecycleResult};

pub const DEFAULT_NAMESPACE: &str = "default";

/// Namespace and secret names: 1-63 chars of `[a-z0-9-]` or `_`/`.` for
/// secret keys, not starting with `-`.
pub fn validate_name(kind: &str, name: &str, extra: &[char]) -> LifecycleResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || extra.contains(&c));
    if valid {
        Ok(())
    } else {
        Err(LifecycleError::InvalidRequest(format!("invalid {kind} name: {name:?}")))
    }
}

pub struct Namespaces {
    repo: Arc<dyn Repository>,
    sealer: Arc<SecretSealer>,
}

impl Namespaces {
    pub fn new(repo: Arc<dyn Repository>, sealer: Arc<SecretSealer>) -> Self {
        Self { repo, sealer }
    }

    fn owned(&self, principal: &Principal, name: &str) -> LifecycleResult<Namespace> {
        let namespace = self.repo.get_namespace(name)?;
        if !principal.may_act_on(&namespace.owner) {
            return Err(LifecycleError::Forbidden(format!(
                "namespace {name} belongs to another principal"
            )));
        }
        Ok(namespace)
    }

    pub fn create(
        &self,
        principal: &Principal,
        name: &str,
        policy: ResourcePolicy,
    ) -> LifecycleResult<Namespace> {
        validate_name("namespace", name, &[])?;
        validate_policy(&policy)?;
        let namespace = Namespace {
            name: name.to_string(),
            owner: principal.id.clone(),
            policy,
            created_at: epoch_secs(),
        };
        self.repo.create_namespace(&namespace)?;
        info!(%name, owner = %principal.id, "namespace created");
        Ok(namespace)
    }

    pub fn set_policy(
        &self,
        principal: &Principal,
        name: &str,
        policy: ResourcePolicy,
    ) -> LifecycleResult<Namespace> {
        self.owned(principal, name)?;
        validate_policy(&policy)?;
        Ok(self.repo.set_namespace_policy(name, policy)?)
    }

    pub fn list(&self) -> LifecycleResult<Vec<Namespace>> {
        Ok(self.repo.list_namespaces()?)
    }

    pub fn get(&self, name: &str) -> LifecycleResult<Namespace> {
        Ok(self.repo.get_namespace(name)?)
    }

    /// Delete a namespace; `InUse` while it still holds workloads.
    pub fn delete(&self, principal: &Principal, name: &str) -> LifecycleResult<()> {
        self.owned(principal, name)?;
        self.repo.delete_namespace(name)?;
        info!(%name, "namespace deleted");
        Ok(())
    }

    /// Seal and store a secret. Creates the namespace on first use.
    pub fn put_secret(
        &self,
        principal: &Principal,
        namespace: &str,
        key: &str,
        value: &str,
    ) -> LifecycleResult<SecretInfo> {
        validate_name("namespace", namespace, &[])?;
        validate_name("secret", key, &['_', '.'])?;
        let ns = self.repo.ensure_namespace(&Namespace {
            name: namespace.to_string(),
            owner: principal.id.clone(),
            policy: ResourcePolicy::default(),
            created_at: epoch_secs(),
        })?;
        if !principal.may_act_on(&ns.owner) {
            return Err(LifecycleError::Forbidden(format!(
                "namespace {namespace} belongs to another principal"
            )));
        }
        let sealed = self.sealer.seal(value.as_bytes())?;
        let info = self.repo.put_secret(namespace, key, sealed)?;
        info!(%namespace, %key, version = info.version, "secret stored");
        Ok(info)
    }

    pub fn list_secrets(
        &self,
        principal: &Principal,
        namespace: &str,
    ) -> LifecycleResult<Vec<SecretInfo>> {
        self.owned(principal, namespace)?;
        Ok(self.repo.list_secrets(namespace)?)
    }

    pub fn delete_secret(
        &self,
        principal: &Principal,
        namespace: &str,
        key: &str,
    ) -> LifecycleResult<()> {
        self.owned(principal, namespace)?;
        self.repo.delete_secret(namespace, key)?;
        info!(%namespace, %key, "secret deleted");
        Ok(())
    }
}

fn validate_policy(policy: &ResourcePolicy) -> LifecycleResult<()> {
    if let (Some(default), Some(max)) = (policy.default_request, policy.max_per_workload) {
        if !default.fits_within(&max) {
            return Err(LifecycleError::InvalidRequest(
                "default request exceeds per-workload maximum".to_string(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use skiff_auth::Scope;
    use skiff_core::{ErrorKind, ResourceRequest};
    use skiff_state::StateStore;

    use super::*;

    fn principal(id: &str, scope: Scope) -> Principal {
        Principal {
            id: id.to_string(),
            label: id.to_string(),
            scopes: BTreeSet::from([scope]),
        }
    }

    fn service() -> (Namespaces, Arc<StateStore>) {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let service = Namespaces::new(
            store.clone(),
            Arc::new(SecretSealer::from_passphrase("test")),
        );
        (service, store)
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("namespace", "team-a", &[]).is_ok());
        assert!(validate_name("namespace", "Team", &[]).is_err());
        assert!(validate_name("namespace", "-x", &[]).is_err());
        assert!(validate_name("namespace", "", &[]).is_err());
        assert!(validate_name("secret", "db_url", &['_', '.']).is_ok());
        assert!(validate_name("namespace", "a/b", &[]).is_err());
    }

    #[test]
    fn secrets_are_sealed_at_rest_and_versioned() {
        let (service, store) = service();
        let alice = principal("alice", Scope::Secrets);

        let first = service.put_secret(&alice, "team-a", "token", "hunter2").unwrap();
        let second = service.put_secret(&alice, "team-a", "token", "hunter3").unwrap();
        assert_eq!((first.version, second.version), (1, 2));

        let stored = store.get_secret("team-a", "token").unwrap();
        assert!(!String::from_utf8_lossy(&stored.sealed).contains("hunter3"));
        assert_eq!(store.get_namespace("team-a").unwrap().owner, "alice");
    }

    #[test]
    fn foreign_namespace_is_forbidden() {
        let (service, _) = service();
        let alice = principal("alice", Scope::Namespaces);
        let bob = principal("bob", Scope::Namespaces);
        service.create(&alice, "team-a", ResourcePolicy::default()).unwrap();

        let err = service.delete(&bob, "team-a").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        let err = service.put_secret(&bob, "team-a", "k", "v").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let admin = principal("root", Scope::Wildcard);
        service.delete(&admin, "team-a").unwrap();
    }

    #[test]
    fn policy_default_must_fit_max() {
        let (service, _) = service();
        let alice = principal("alice", Scope::Namespaces);
        let bad = ResourcePolicy {
            default_request: Some(ResourceRequest::new(2000, 64, 0)),
            max_per_workload: Some(ResourceRequest::new(1000, 1024, 0)),
        };
        let err = service.create(&alice, "team-a", bad).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn delete_secret_requires_existing_key() {
        let (service, _) = service();
        let alice = principal("alice", Scope::Secrets);
        service.put_secret(&alice, "team-a", "k", "v").unwrap();
        service.delete_secret(&alice, "team-a", "k").unwrap();
        let err = service.delete_secret(&alice, "team-a", "k").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(service.list_secrets(&alice, "team-a").unwrap().is_empty());
    }
}
