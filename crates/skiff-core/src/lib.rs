//! skiff-core: shared building blocks for the Skiff control plane.
//!
//! Holds the pieces every other crate agrees on: the stable error kind
//! taxonomy surfaced to clients, the daemon configuration file format, the
//! resource vocabulary, and the read-only workload template catalog.

pub mod config;
pub mod error;
pub mod ids;
pub mod resources;
pub mod templates;

pub use config::SkiffConfig;
pub use error::ErrorKind;
pub use ids::SubstrateHandle;
pub use resources::{Ceiling, ResourceRequest};
pub use templates::{Template, TemplateCatalog};

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
