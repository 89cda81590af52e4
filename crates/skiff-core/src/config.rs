//! skiff.toml configuration parser.
//!
//! Every section has defaults, so an empty file (or no file at all) yields a
//! working single-node configuration. Durations are written the humantime
//! way: `"250ms"`, `"30s"`, `"5m"`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::resources::{Ceiling, ResourceRequest};
use crate::templates::Template;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SkiffConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub quotas: QuotaConfig,
    pub lifecycle: LifecycleConfig,
    pub sessions: SessionConfig,
    pub health: HealthConfig,
    pub secrets: SecretsConfig,
    pub substrate: SubstrateConfig,
    pub templates: Vec<Template>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Keep all state in memory (lost on exit).
    pub in_memory: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/skiff"),
            in_memory: false,
        }
    }
}

/// API keys installed at startup.
///
/// Key material never lives in the file itself: each entry names the
/// environment variable that carries the secret.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub bootstrap_keys: Vec<BootstrapKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapKey {
    pub label: String,
    pub key_env: String,
    #[serde(default = "wildcard_scopes")]
    pub scopes: Vec<String>,
}

impl BootstrapKey {
    /// Read the key material from the environment, if set and non-empty.
    pub fn secret(&self) -> Option<String> {
        std::env::var(&self.key_env).ok().filter(|v| !v.trim().is_empty())
    }
}

fn wildcard_scopes() -> Vec<String> {
    vec!["*".to_string()]
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Ceiling applied to principals without an explicit one.
    pub default_principal_ceiling: Option<Ceiling>,
    /// Ceiling applied to namespaces without an explicit one.
    pub default_namespace_ceiling: Option<Ceiling>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Prefix of the substrate handle derived from a workload id.
    pub handle_prefix: String,
    /// Workloads stuck in Starting longer than this are failed.
    #[serde(with = "humantime_serde")]
    pub start_deadline: Duration,
    #[serde(with = "humantime_serde")]
    pub reconcile_interval: Duration,
    /// How long Deleted tombstones are kept before being purged.
    #[serde(with = "humantime_serde")]
    pub tombstone_retention: Duration,
    /// Resources given to a workload in a namespace without a default policy.
    pub default_resources: ResourceRequest,
    pub retry: RetryConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            handle_prefix: "skiff".to_string(),
            start_deadline: Duration::from_secs(300),
            reconcile_interval: Duration::from_secs(15),
            tombstone_retention: Duration::from_secs(3600),
            default_resources: ResourceRequest::new(500, 512, 0),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Frames buffered per direction of an exec/connect session before the
    /// producer is made to wait.
    pub interactive_buffer: usize,
    /// Entries retained for a lagging log/metric consumer before the oldest
    /// are dropped.
    pub stream_buffer: usize,
    /// Upper bound on how long closing a session may take.
    #[serde(with = "humantime_serde")]
    pub close_grace: Duration,
    #[serde(with = "humantime_serde")]
    pub metrics_interval: Duration,
    /// Command attached to by `connect` sessions.
    pub connect_command: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            interactive_buffer: 64,
            stream_buffer: 256,
            close_grace: Duration::from_secs(2),
            metrics_interval: Duration::from_secs(5),
            connect_command: vec!["/bin/sh".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Machines silent for longer than this read as unreachable.
    #[serde(with = "humantime_serde")]
    pub staleness_window: Duration,
    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// Consecutive probe failures before a machine is reported unreachable.
    pub unreachable_threshold: u32,
    pub probes: Vec<ProbeTarget>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            staleness_window: Duration::from_secs(60),
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
            unreachable_threshold: 3,
            probes: Vec::new(),
        }
    }
}

/// A machine whose health endpoint the daemon probes itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeTarget {
    pub machine_id: String,
    /// `host:port` of the machine's health endpoint.
    pub address: String,
    #[serde(default = "default_probe_path")]
    pub path: String,
}

fn default_probe_path() -> String {
    "/healthz".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// Environment variable holding the secret-sealing passphrase.
    pub master_key_env: String,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            master_key_env: "SKIFF_MASTER_KEY".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubstrateConfig {
    /// Root directory of the local substrate. Defaults to `<data_dir>/substrate`.
    pub root: Option<PathBuf>,
}

impl SkiffConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: SkiffConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Root directory handed to the local substrate.
    pub fn substrate_root(&self) -> PathBuf {
        self.substrate
            .root
            .clone()
            .unwrap_or_else(|| self.storage.data_dir.join("substrate"))
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.lifecycle.retry.max_attempts == 0 {
            anyhow::bail!("lifecycle.retry.max_attempts must be at least 1");
        }
        if self.sessions.interactive_buffer == 0 || self.sessions.stream_buffer == 0 {
            anyhow::bail!("session buffers must be non-zero");
        }
        if self.sessions.connect_command.is_empty() {
            anyhow::bail!("sessions.connect_command must name a program");
        }
        let mut seen = std::collections::HashSet::new();
        for template in &self.templates {
            if !seen.insert(template.id.as_str()) {
                anyhow::bail!("duplicate template id: {}", template.id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = SkiffConfig::from_toml_str("").unwrap();
        assert_eq!(config.server.listen.port(), 8080);
        assert_eq!(config.lifecycle.handle_prefix, "skiff");
        assert_eq!(config.lifecycle.retry.max_attempts, 4);
        assert_eq!(config.health.staleness_window, Duration::from_secs(60));
        assert!(config.auth.bootstrap_keys.is_empty());
    }

    #[test]
    fn parses_durations_and_sections() {
        let toml_str = r#"
[server]
listen = "127.0.0.1:9000"

[lifecycle]
start_deadline = "90s"

[lifecycle.retry]
max_attempts = 2
base_delay = "10ms"

[[auth.bootstrap_keys]]
label = "operator"
key_env = "SKIFF_TEST_OPERATOR_KEY"

[quotas.default_principal_ceiling]
max_workloads = 3
max_memory_mb = 4096

[[templates]]
id = "python"
image = "python:3.12-slim"
"#;
        let config = SkiffConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.server.listen.port(), 9000);
        assert_eq!(config.lifecycle.start_deadline, Duration::from_secs(90));
        assert_eq!(config.lifecycle.retry.base_delay, Duration::from_millis(10));
        assert_eq!(config.auth.bootstrap_keys[0].scopes, vec!["*".to_string()]);
        let ceiling = config.quotas.default_principal_ceiling.unwrap();
        assert_eq!(ceiling.max_workloads, Some(3));
        assert_eq!(ceiling.max_cpu_millis, None);
        assert_eq!(config.templates[0].id, "python");
    }

    #[test]
    fn rejects_zero_retry_attempts() {
        let err = SkiffConfig::from_toml_str("[lifecycle.retry]\nmax_attempts = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn rejects_duplicate_templates() {
        let toml_str = r#"
[[templates]]
id = "a"
image = "x"

[[templates]]
id = "a"
image = "y"
"#;
        assert!(SkiffConfig::from_toml_str(toml_str).is_err());
    }

    #[test]
    fn substrate_root_defaults_under_data_dir() {
        let mut config = SkiffConfig::default();
        config.storage.data_dir = PathBuf::from("/tmp/skiff");
        assert_eq!(config.substrate_root(), PathBuf::from("/tmp/skiff/substrate"));
    }

    #[test]
    fn bootstrap_key_missing_env_yields_none() {
        let key = BootstrapKey {
            label: "x".to_string(),
            key_env: "SKIFF_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            scopes: wildcard_scopes(),
        };
        assert!(key.secret().is_none());
    }

    #[test]
    fn round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skiff.toml");
        std::fs::write(&path, SkiffConfig::default().to_toml_string().unwrap()).unwrap();
        let config = SkiffConfig::from_file(&path).unwrap();
        assert_eq!(config.sessions.interactive_buffer, 64);
    }
}
