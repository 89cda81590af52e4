//! Read-only catalog of parametrized workload templates.
//!
//! Templates are declared in `skiff.toml` under `[[templates]]` and served
//! as-is by `/templates`. A create request may name a template; the request's
//! own fields win over the template's.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::resources::ResourceRequest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub resources: Option<ResourceRequest>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Immutable, id-ordered set of templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    templates: BTreeMap<String, Template>,
}

impl TemplateCatalog {
    pub fn new(templates: impl IntoIterator<Item = Template>) -> Self {
        Self {
            templates: templates.into_iter().map(|t| (t.id.clone(), t)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Template> {
        self.templates.get(id)
    }

    pub fn list(&self) -> Vec<&Template> {
        self.templates.values().collect()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
