//! Reservation ledger.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use skiff_core::config::QuotaConfig;
use skiff_core::{Ceiling, ResourceRequest};

use crate::error::{QuotaError, QuotaResult};

/// Who a ceiling applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum QuotaSubject {
    Principal(String),
    Namespace(String),
}

impl QuotaSubject {
    pub fn from_parts(kind: &str, id: impl Into<String>) -> Option<Self> {
        match kind {
            "principal" => Some(QuotaSubject::Principal(id.into())),
            "namespace" => Some(QuotaSubject::Namespace(id.into())),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            QuotaSubject::Principal(_) => "principal",
            QuotaSubject::Namespace(_) => "namespace",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            QuotaSubject::Principal(id) | QuotaSubject::Namespace(id) => id,
        }
    }
}

impl fmt::Display for QuotaSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaSubject::Principal(id) => write!(f, "principal {id}"),
            QuotaSubject::Namespace(name) => write!(f, "namespace {name}"),
        }
    }
}

/// Resources currently held by one subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Usage {
    pub workloads: u32,
    pub resources: ResourceRequest,
}

impl Usage {
    fn plus(self, request: ResourceRequest) -> Self {
        Self {
            workloads: self.workloads.saturating_add(1),
            resources: self.resources.saturating_add(request),
        }
    }

    fn minus(self, request: ResourceRequest) -> Self {
        Self {
            workloads: self.workloads.saturating_sub(1),
            resources: self.resources.saturating_sub(request),
        }
    }
}

/// Capability to release one reservation. Holds no workload reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    id: u64,
    pub principal: String,
    pub namespace: String,
    pub request: ResourceRequest,
}

impl Token {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Ceiling and usage of one subject, as served by `GET /quotas`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaReport {
    pub subject: QuotaSubject,
    /// Effective ceiling; `None` means unlimited.
    pub ceiling: Option<Ceiling>,
    /// Whether the ceiling was set explicitly rather than inherited from the
    /// configured default.
    pub explicit: bool,
    pub usage: Usage,
}

#[derive(Default)]
struct Ledger {
    ceilings: HashMap<QuotaSubject, Ceiling>,
    usage: HashMap<QuotaSubject, Usage>,
    outstanding: HashMap<u64, Token>,
    next_id: u64,
}

impl Ledger {
    fn issue(&mut self, principal: &str, namespace: &str, request: ResourceRequest) -> Token {
        self.next_id += 1;
        let token = Token {
            id: self.next_id,
            principal: principal.to_string(),
            namespace: namespace.to_string(),
            request,
        };
        for subject in subjects(&token) {
            let entry = self.usage.entry(subject).or_default();
            *entry = entry.plus(request);
        }
        self.outstanding.insert(token.id, token.clone());
        token
    }
}

fn subjects(token: &Token) -> [QuotaSubject; 2] {
    [
        QuotaSubject::Principal(token.principal.clone()),
        QuotaSubject::Namespace(token.namespace.clone()),
    ]
}

pub struct QuotaEngine {
    ledger: Mutex<Ledger>,
    default_principal: Option<Ceiling>,
    default_namespace: Option<Ceiling>,
}

impl QuotaEngine {
    pub fn new(config: &QuotaConfig) -> Self {
        Self {
            ledger: Mutex::new(Ledger::default()),
            default_principal: config.default_principal_ceiling,
            default_namespace: config.default_namespace_ceiling,
        }
    }

    /// Engine with no ceilings at all.
    pub fn unlimited() -> Self {
        Self::new(&QuotaConfig::default())
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn effective(&self, ledger: &Ledger, subject: &QuotaSubject) -> Option<Ceiling> {
        ledger.ceilings.get(subject).copied().or(match subject {
            QuotaSubject::Principal(_) => self.default_principal,
            QuotaSubject::Namespace(_) => self.default_namespace,
        })
    }

    /// Reserve `request` for a workload owned by `principal` in `namespace`.
    ///
    /// Fails without side effects if either subject's ceiling would be
    /// exceeded on any dimension. Never blocks beyond the ledger lock.
    pub fn reserve(
        &self,
        principal: &str,
        namespace: &str,
        request: ResourceRequest,
    ) -> QuotaResult<Token> {
        let mut ledger = self.lock();
        for subject in [
            QuotaSubject::Principal(principal.to_string()),
            QuotaSubject::Namespace(namespace.to_string()),
        ] {
            if let Some(ceiling) = self.effective(&ledger, &subject) {
                let after = ledger.usage.get(&subject).copied().unwrap_or_default().plus(request);
                if let Some(dimension) = ceiling.first_exceeded(after.workloads, &after.resources) {
                    debug!(%subject, dimension, "reservation refused");
                    return Err(QuotaError::Exceeded { subject, dimension });
                }
            }
        }
        let token = ledger.issue(principal, namespace, request);
        debug!(token = token.id, principal, namespace, "reservation granted");
        Ok(token)
    }

    /// Re-establish a reservation for a workload that already exists,
    /// bypassing ceilings. Used when recovering state at startup.
    pub fn restore(&self, principal: &str, namespace: &str, request: ResourceRequest) -> Token {
        let token = self.lock().issue(principal, namespace, request);
        debug!(token = token.id, principal, namespace, "reservation restored");
        token
    }

    /// Return a reservation. Returns `false` if it was already released.
    pub fn release(&self, token: &Token) -> bool {
        let mut ledger = self.lock();
        if ledger.outstanding.remove(&token.id).is_none() {
            return false;
        }
        for subject in subjects(token) {
            if let Some(entry) = ledger.usage.get_mut(&subject) {
                *entry = entry.minus(token.request);
                if entry.workloads == 0 {
                    ledger.usage.remove(&subject);
                }
            }
        }
        debug!(token = token.id, principal = %token.principal, "reservation released");
        true
    }

    pub fn set_ceiling(&self, subject: QuotaSubject, ceiling: Ceiling) {
        info!(%subject, ?ceiling, "quota ceiling set");
        self.lock().ceilings.insert(subject, ceiling);
    }

    /// Drop an explicit ceiling; the subject falls back to the default.
    pub fn clear_ceiling(&self, subject: &QuotaSubject) -> bool {
        let removed = self.lock().ceilings.remove(subject).is_some();
        if removed {
            info!(%subject, "quota ceiling cleared");
        }
        removed
    }

    pub fn usage(&self, subject: &QuotaSubject) -> Usage {
        self.lock().usage.get(subject).copied().unwrap_or_default()
    }

    pub fn report(&self, subject: &QuotaSubject) -> QuotaReport {
        let ledger = self.lock();
        QuotaReport {
            subject: subject.clone(),
            ceiling: self.effective(&ledger, subject),
            explicit: ledger.ceilings.contains_key(subject),
            usage: ledger.usage.get(subject).copied().unwrap_or_default(),
        }
    }

    /// Reports for every subject with usage or an explicit ceiling.
    pub fn reports(&self) -> Vec<QuotaReport> {
        let ledger = self.lock();
        let mut subjects: Vec<_> = ledger
            .ceilings
            .keys()
            .chain(ledger.usage.keys())
            .cloned()
            .collect();
        subjects.sort();
        subjects.dedup();
        subjects
            .into_iter()
            .map(|subject| QuotaReport {
                ceiling: self.effective(&ledger, &subject),
                explicit: ledger.ceilings.contains_key(&subject),
                usage: ledger.usage.get(&subject).copied().unwrap_or_default(),
                subject,
            })
            .collect()
    }

    pub fn outstanding(&self) -> usize {
        self.lock().outstanding.len()
    }
}
