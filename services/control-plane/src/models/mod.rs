use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Desired lifecycle state, set by the API layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "desired_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Running,
    Stopped,
}

impl Default for DesiredState {
    fn default() -> Self {
        DesiredState::Running
    }
}

/// Opaque backend-issued identifier for one bot instance
/// (process slot, container id, pod name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuntimeHandle(pub String);

impl RuntimeHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuntimeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backend-specific creation parameters for a bot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSpec {
    /// Image reference (container and cluster backends)
    #[serde(default)]
    pub image: Option<String>,
    /// Program and arguments (required by the local backend, optional override elsewhere)
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Port the bot's HTTP API listens on inside its sandbox
    #[serde(default = "default_bot_port")]
    pub port: u16,
    #[serde(default)]
    pub cpu_limit: Option<f64>,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_bot_port() -> u16 {
    8080
}

impl Default for CreateSpec {
    fn default() -> Self {
        Self {
            image: None,
            command: Vec::new(),
            env: BTreeMap::new(),
            port: default_bot_port(),
            cpu_limit: None,
            memory_limit_mb: None,
            labels: BTreeMap::new(),
        }
    }
}

/// Bot record as owned by the API layer
#[derive(Debug, Clone, Serialize)]
pub struct BotInstance {
    pub id: Uuid,
    pub name: String,
    /// Backend discriminator ("local", "container", "cluster", ...)
    pub backend: String,
    pub spec: CreateSpec,
    pub desired_state: DesiredState,
    pub runtime_handle: Option<RuntimeHandle>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BotInstance {
    pub fn new(name: impl Into<String>, backend: impl Into<String>, spec: CreateSpec) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            backend: backend.into(),
            spec,
            desired_state: DesiredState::Running,
            runtime_handle: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_handle(mut self, handle: RuntimeHandle) -> Self {
        self.runtime_handle = Some(handle);
        self
    }
}

/// Point-in-time health record for one bot.
///
/// Always written wholesale; a failed inspect produces a failure record via
/// [`StatusSnapshot::failure`] instead of patching the previous snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub healthy: bool,
    /// CPU share in percent of one core
    pub cpu_usage: Option<f64>,
    /// Resident memory in bytes
    pub memory_usage: Option<u64>,
    pub ip_address: Option<String>,
    pub host_port: Option<u16>,
    pub backend_handle: Option<String>,
    pub error_message: Option<String>,
    pub last_seen_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl StatusSnapshot {
    /// Empty snapshot for a handle, stamped now. Backends fill in what they know.
    pub fn for_handle(handle: &RuntimeHandle) -> Self {
        Self {
            healthy: false,
            cpu_usage: None,
            memory_usage: None,
            ip_address: None,
            host_port: None,
            backend_handle: Some(handle.to_string()),
            error_message: None,
            last_seen_at: Utc::now(),
            started_at: None,
            stopped_at: None,
        }
    }

    pub fn failure(handle: Option<&RuntimeHandle>, error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            cpu_usage: None,
            memory_usage: None,
            ip_address: None,
            host_port: None,
            backend_handle: handle.map(|h| h.to_string()),
            error_message: Some(error.into()),
            last_seen_at: Utc::now(),
            started_at: None,
            stopped_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Network location the proxy forwards a bot's traffic to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub scheme: Scheme,
}

impl Endpoint {
    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            scheme: Scheme::Http,
        }
    }

    /// `host:port`, suitable for the outbound Host header
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme.as_str(), self.authority())
    }
}

/// Lifecycle action requested through the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotAction {
    Start,
    Stop,
    Restart,
}

#[derive(Debug, Deserialize)]
pub struct BotActionRequest {
    pub action: BotAction,
}

/// Response for GET /bots/{id}/status
#[derive(Debug, Serialize)]
pub struct BotStatusResponse {
    pub bot_id: Uuid,
    pub backend: String,
    pub desired_state: DesiredState,
    pub healthy: bool,
    pub backend_handle: Option<String>,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<u64>,
    pub ip_address: Option<String>,
    pub host_port: Option<u16>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl BotStatusResponse {
    pub fn new(bot: &BotInstance, snapshot: Option<StatusSnapshot>) -> Self {
        let handle = bot.runtime_handle.as_ref().map(|h| h.to_string());
        match snapshot {
            Some(s) => Self {
                bot_id: bot.id,
                backend: bot.backend.clone(),
                desired_state: bot.desired_state,
                healthy: s.healthy,
                backend_handle: s.backend_handle.or(handle),
                cpu_usage: s.cpu_usage,
                memory_usage: s.memory_usage,
                ip_address: s.ip_address,
                host_port: s.host_port,
                error_message: s.error_message,
                created_at: bot.created_at,
                started_at: s.started_at,
                stopped_at: s.stopped_at,
                last_seen_at: Some(s.last_seen_at),
            },
            None => Self {
                bot_id: bot.id,
                backend: bot.backend.clone(),
                desired_state: bot.desired_state,
                healthy: false,
                backend_handle: handle,
                cpu_usage: None,
                memory_usage: None,
                ip_address: None,
                host_port: None,
                error_message: None,
                created_at: bot.created_at,
                started_at: None,
                stopped_at: None,
                last_seen_at: None,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProvisionResponse {
    pub bot_id: Uuid,
    pub backend: String,
    pub runtime_handle: RuntimeHandle,
}

/// Request body for POST /bots/{id}/data-prep
#[derive(Debug, Deserialize)]
pub struct DataPrepRequest {
    /// Path on the bot's own API that performs the preparation
    pub path: String,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}
