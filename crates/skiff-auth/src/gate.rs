//! API key registry: issue, revoke, validate, authorize.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use skiff_core::config::AuthConfig;
use skiff_core::epoch_secs;
use skiff_state::{Repository, StateError, StoredApiKey};

use crate::error::{AuthError, AuthResult};
use crate::scope::Scope;

/// Authenticated identity behind a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    /// Key id; the owner recorded on workloads and quota reservations.
    pub id: String,
    pub label: String,
    pub scopes: BTreeSet<Scope>,
}

impl Principal {
    /// True if the principal may perform operations guarded by `required`.
    pub fn has(&self, required: Scope) -> bool {
        self.scopes.contains(&Scope::Wildcard) || self.scopes.contains(&required)
    }

    /// Wildcard and admin keys act on resources they do not own.
    pub fn is_admin(&self) -> bool {
        self.scopes.contains(&Scope::Wildcard) || self.scopes.contains(&Scope::Admin)
    }

    pub fn may_act_on(&self, owner: &str) -> bool {
        self.is_admin() || self.id == owner
    }
}

/// Client-visible description of a key. Never includes key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiKeyInfo {
    pub id: String,
    pub label: String,
    pub scopes: Vec<Scope>,
    pub created_at: u64,
}

/// Result of [`AuthGate::issue`]; `secret` is shown exactly once.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedKey {
    #[serde(flatten)]
    pub info: ApiKeyInfo,
    pub secret: String,
}

struct KeyRecord {
    info: ApiKeyInfo,
    digest: [u8; 32],
    /// Installed from configuration rather than issued; never persisted.
    bootstrap: bool,
}

impl KeyRecord {
    fn to_stored(&self) -> StoredApiKey {
        StoredApiKey {
            id: self.info.id.clone(),
            label: self.info.label.clone(),
            scopes: self.info.scopes.iter().map(|s| s.as_str().to_string()).collect(),
            digest: hex::encode(self.digest),
            created_at: self.info.created_at,
        }
    }

    fn from_stored(stored: &StoredApiKey) -> AuthResult<Self> {
        let invalid = |reason: String| AuthError::InvalidRecord {
            id: stored.id.clone(),
            reason,
        };
        let digest: [u8; 32] = hex::decode(&stored.digest)
            .map_err(|e| invalid(e.to_string()))?
            .try_into()
            .map_err(|_| invalid("digest is not 32 bytes".to_string()))?;
        Ok(Self {
            info: ApiKeyInfo {
                id: stored.id.clone(),
                label: stored.label.clone(),
                scopes: dedup(Scope::parse_all(&stored.scopes)?),
                created_at: stored.created_at,
            },
            digest,
            bootstrap: false,
        })
    }
}

#[derive(Default)]
pub struct AuthGate {
    keys: RwLock<HashMap<String, KeyRecord>>,
    /// Where issued keys are written. `None` keeps them in memory only.
    store: Option<Arc<dyn Repository>>,
}

impl AuthGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// A gate whose issued keys are persisted in `store`. Keys issued
    /// before a restart are loaded back.
    pub fn persistent(store: Arc<dyn Repository>) -> AuthResult<Self> {
        let stored = store.list_api_keys()?;
        let gate = Self {
            keys: RwLock::default(),
            store: Some(store),
        };
        let mut loaded = 0;
        for entry in &stored {
            match KeyRecord::from_stored(entry) {
                Ok(record) => {
                    gate.insert(record);
                    loaded += 1;
                }
                Err(e) => warn!(id = %entry.id, error = %e, "skipping stored API key"),
            }
        }
        info!(loaded, "issued API keys loaded");
        Ok(gate)
    }

    /// Build an in-memory gate holding the bootstrap keys named in
    /// configuration.
    pub fn from_config(config: &AuthConfig) -> AuthResult<Self> {
        let gate = Self::new();
        gate.install_bootstrap(config)?;
        Ok(gate)
    }

    /// Install the bootstrap keys named in configuration.
    ///
    /// Entries whose environment variable is unset are skipped with a
    /// warning; a gate with no keys rejects every authenticated request.
    pub fn install_bootstrap(&self, config: &AuthConfig) -> AuthResult<()> {
        for entry in &config.bootstrap_keys {
            let scopes = Scope::parse_all(&entry.scopes)?;
            match entry.secret() {
                Some(secret) => {
                    let info = self.install(&entry.label, &secret, scopes);
                    info!(
                        id = %info.id,
                        label = %info.label,
                        fingerprint = %fingerprint(&secret),
                        "bootstrap key installed"
                    );
                }
                None => {
                    warn!(label = %entry.label, env = %entry.key_env, "bootstrap key env var unset, skipping");
                }
            }
        }
        if self.is_empty() {
            warn!("no API keys configured; all authenticated endpoints will reject requests");
        }
        Ok(())
    }

    fn insert(&self, record: KeyRecord) -> Option<KeyRecord> {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.info.id.clone(), record)
    }

    /// Register caller-supplied key material under an id derived from
    /// `label`, so the principal keeps its identity across restarts.
    /// Installing the same label again replaces the key material.
    pub fn install(&self, label: &str, secret: &str, scopes: Vec<Scope>) -> ApiKeyInfo {
        let info = ApiKeyInfo {
            id: bootstrap_key_id(label),
            label: label.to_string(),
            scopes: dedup(scopes),
            created_at: epoch_secs(),
        };
        let replaced = self.insert(KeyRecord {
            info: info.clone(),
            digest: digest(secret),
            bootstrap: true,
        });
        if replaced.is_some() {
            warn!(id = %info.id, %label, "key material replaced for existing label");
        }
        info
    }

    /// Mint a new random key, persisting it when the gate has a store.
    pub fn issue(&self, label: &str, scopes: Vec<Scope>) -> AuthResult<IssuedKey> {
        let secret = format!(
            "sk_{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        let record = KeyRecord {
            info: ApiKeyInfo {
                id: new_key_id(),
                label: label.to_string(),
                scopes: dedup(scopes),
                created_at: epoch_secs(),
            },
            digest: digest(&secret),
            bootstrap: false,
        };
        if let Some(store) = &self.store {
            store.create_api_key(&record.to_stored())?;
        }
        let info = record.info.clone();
        self.insert(record);
        info!(id = %info.id, label = %info.label, scopes = ?info.scopes, "API key issued");
        Ok(IssuedKey { info, secret })
    }

    /// Revoke a key. Revoking a bootstrap key lasts until the next start,
    /// when configuration installs it again.
    pub fn revoke(&self, id: &str) -> AuthResult<()> {
        let bootstrap = {
            let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
            match keys.get(id) {
                Some(record) => record.bootstrap,
                None => return Err(AuthError::NotFound(id.to_string())),
            }
        };
        if let (Some(store), false) = (&self.store, bootstrap) {
            match store.delete_api_key(id) {
                Ok(()) | Err(StateError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        let removed = self
            .keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        match removed {
            Some(record) => {
                if bootstrap {
                    warn!(id, label = %record.info.label, "bootstrap key revoked until restart");
                } else {
                    info!(id, label = %record.info.label, "API key revoked");
                }
                Ok(())
            }
            None => Err(AuthError::NotFound(id.to_string())),
        }
    }

    pub fn list(&self) -> Vec<ApiKeyInfo> {
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        let mut infos: Vec<_> = keys.values().map(|r| r.info.clone()).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        infos
    }

    pub fn is_empty(&self) -> bool {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Resolve presented key material to a principal.
    ///
    /// Every stored digest is compared so the time taken does not depend on
    /// which key (if any) matched.
    pub fn validate(&self, presented: &str) -> AuthResult<Principal> {
        if presented.is_empty() {
            return Err(AuthError::Unauthorized);
        }
        let candidate = digest(presented);
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        let mut matched: Option<&KeyRecord> = None;
        for record in keys.values() {
            if bool::from(record.digest[..].ct_eq(&candidate[..])) {
                matched = Some(record);
            }
        }
        match matched {
            Some(record) => {
                debug!(id = %record.info.id, "API key validated");
                Ok(Principal {
                    id: record.info.id.clone(),
                    label: record.info.label.clone(),
                    scopes: record.info.scopes.iter().copied().collect(),
                })
            }
            None => Err(AuthError::Unauthorized),
        }
    }

    pub fn authorize(&self, principal: &Principal, required: Scope) -> bool {
        principal.has(required)
    }

    /// Like [`AuthGate::authorize`] but yields `Forbidden` on failure.
    pub fn require(&self, principal: &Principal, required: Scope) -> AuthResult<()> {
        if self.authorize(principal, required) {
            Ok(())
        } else {
            Err(AuthError::Forbidden(required))
        }
    }
}

fn digest(secret: &str) -> [u8; 32] {
    Sha256::digest(secret.as_bytes()).into()
}

/// Stable id for a key installed from configuration.
fn bootstrap_key_id(label: &str) -> String {
    let digest = Sha256::digest(format!("bootstrap/{label}").as_bytes());
    format!("key-{}", hex::encode(&digest[..6]))
}

fn new_key_id() -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("key-{}", &raw[..12])
}

fn dedup(scopes: Vec<Scope>) -> Vec<Scope> {
    scopes.into_iter().collect::<BTreeSet<_>>().into_iter().collect()
}

/// Hex SHA-256 fingerprint of key material, safe to log.
pub fn fingerprint(secret: &str) -> String {
    hex::encode(&digest(secret)[..8])
}
