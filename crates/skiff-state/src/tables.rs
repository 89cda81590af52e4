//! redb table definitions for the Skiff repository.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Workload records keyed by `{workload_id}`.
pub const WORKLOADS: TableDefinition<&str, &[u8]> = TableDefinition::new("workloads");

/// Namespaces keyed by `{name}`.
pub const NAMESPACES: TableDefinition<&str, &[u8]> = TableDefinition::new("namespaces");

/// Sealed secrets keyed by `{namespace}/{key}`.
pub const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");

/// Snapshot records keyed by `{snapshot_id}`.
pub const SNAPSHOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshots");

/// Issued API keys keyed by `{key_id}`.
pub const API_KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("api_keys");

/// Explicit quota ceilings keyed by `{kind}/{id}`.
pub const CEILINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("ceilings");
