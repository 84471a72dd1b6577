//! Service configuration
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! `config/fleet.toml`, then `FLEET__*` environment variables
//! (e.g. `FLEET__MONITOR__INTERVAL_SECS=15`). Lists are comma separated:
//! `FLEET__COORDINATION__ENDPOINTS=redis://a:6379,redis://b:6379`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub coordination: CoordinationConfig,
    pub monitor: MonitorConfig,
    pub proxy: ProxyConfig,
    pub backends: BackendsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// How long shutdown waits for in-flight health checks
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            shutdown_grace_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres URL. Empty runs against the in-memory store.
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 20,
            acquire_timeout_secs: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Coordination store endpoints. Empty means permanent single-instance mode.
    pub endpoints: Vec<String>,
    pub connect_timeout_secs: u64,
    pub lease_ttl_secs: u64,
    pub key_prefix: String,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            connect_timeout_secs: 5,
            lease_ttl_secs: 15,
            key_prefix: "fleet".to_string(),
        }
    }
}

impl CoordinationConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Stable replica id; generated from HOSTNAME when unset
    pub instance_id: Option<String>,
    pub interval_secs: u64,
    pub inspect_timeout_secs: u64,
    pub max_concurrent_checks: usize,
    /// Upper bound for bot-triggered data preparation jobs (hours-long downloads)
    pub data_prep_timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            interval_secs: 30,
            inspect_timeout_secs: 10,
            max_concurrent_checks: 16,
            data_prep_timeout_secs: 4 * 60 * 60,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn inspect_timeout(&self) -> Duration {
        Duration::from_secs(self.inspect_timeout_secs.max(1))
    }

    pub fn data_prep_timeout(&self) -> Duration {
        Duration::from_secs(self.data_prep_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub connect_timeout_secs: u64,
    /// Wait for upstream response headers; bodies stream without a deadline
    pub response_timeout_secs: u64,
    /// Per-subpath overrides, e.g. `{"/api/v1/download-data": 600}`
    pub route_timeouts: HashMap<String, u64>,
    pub pool_idle_timeout_secs: u64,
    /// Seconds advertised in Retry-After when a bot is not reachable yet
    pub retry_after_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            response_timeout_secs: 30,
            route_timeouts: HashMap::new(),
            pool_idle_timeout_secs: 90,
            retry_after_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    pub local: LocalBackendConfig,
    pub container: ContainerBackendConfig,
    pub cluster: ClusterBackendConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalBackendConfig {
    pub enabled: bool,
    pub bind_host: String,
    pub work_dir: Option<PathBuf>,
    pub stop_grace_secs: u64,
}

impl Default for LocalBackendConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_host: "127.0.0.1".to_string(),
            work_dir: None,
            stop_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContainerBackendConfig {
    pub enabled: bool,
    /// Docker Engine API base URL (TCP socket)
    pub api_url: String,
    /// Network containers join; its IP is used when no host port is published
    pub network: Option<String>,
    /// Publish the bot port on the host and proxy to it instead of the container IP
    pub publish_ports: bool,
    pub request_timeout_secs: u64,
}

impl Default for ContainerBackendConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: "http://127.0.0.1:2375".to_string(),
            network: None,
            publish_ports: false,
            request_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterBackendConfig {
    pub enabled: bool,
    /// Kubernetes API server URL. Empty disables the backend.
    pub api_url: String,
    pub namespace: String,
    /// Bearer token; falls back to the in-cluster service account token file
    pub token: Option<String>,
    pub cluster_domain: String,
    pub request_timeout_secs: u64,
}

impl Default for ClusterBackendConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: String::new(),
            namespace: "trading-bots".to_string(),
            token: None,
            cluster_domain: "cluster.local".to_string(),
            request_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    pub level: String,
    /// Enable JSON formatted logs
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Settings {
    /// Load configuration from `config/` and the environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let mut settings: Settings = Config::builder()
            .add_source(File::from(config_dir.join("fleet.toml")).required(false))
            .add_source(
                Environment::with_prefix("FLEET")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("coordination.endpoints")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        // Conventional variables used by the deployment scripts
        if let Ok(url) = std::env::var("DATABASE_URL") {
            settings.database.url = url;
        }
        if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
            settings.server.port = port;
        }

        Ok(settings)
    }

    /// Backends this replica should register. Local processes are only reachable
    /// from the replica that spawned them, so the local backend is switched off
    /// once replicas share the fleet through a coordination store.
    pub fn effective_backends(&self) -> BackendsConfig {
        let mut backends = self.backends.clone();
        if backends.local.enabled && !self.coordination.endpoints.is_empty() {
            warn!("Local backend disabled: coordination endpoints are configured and local processes cannot be shared between replicas");
            backends.local.enabled = false;
        }
        backends
    }

    /// Replica id for this process
    pub fn instance_id(&self) -> String {
        if let Some(id) = self.monitor.instance_id.as_ref().filter(|s| !s.is_empty()) {
            return id.clone();
        }
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "fleet".to_string());
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", host, &suffix[..8])
    }
}
