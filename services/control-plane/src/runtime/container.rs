//! Container backend (Docker Engine HTTP API)
//!
//! Bots run as containers on a Docker host reachable over TCP. The endpoint is the
//! published host port when ports are published, otherwise the container's IP on
//! its network plus the bot port.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{RegistryBuilder, Runtime};
use crate::config::ContainerBackendConfig;
use crate::error::RuntimeError;
use crate::models::{CreateSpec, Endpoint, RuntimeHandle, StatusSnapshot};

pub const BACKEND: &str = "container";

/// Label carrying the bot's listening port, read back on inspect
const PORT_LABEL: &str = "fleet.bot-port";
const MANAGED_LABEL: &str = "fleet.managed";
const STOP_TIMEOUT_SECS: u64 = 10;

pub fn register(builder: &mut RegistryBuilder) {
    builder.register(BACKEND, |config| {
        if !config.container.enabled {
            return Ok(None);
        }
        let runtime = ContainerRuntime::new(config.container.clone())?;
        Ok(Some(Arc::new(runtime) as Arc<dyn Runtime>))
    });
}

pub struct ContainerRuntime {
    config: ContainerBackendConfig,
    client: reqwest::Client,
    base_url: String,
}

impl ContainerRuntime {
    pub fn new(config: ContainerBackendConfig) -> Result<Self, RuntimeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| RuntimeError::Provision(format!("docker client: {}", e)))?;
        let base_url = config.api_url.trim_end_matches('/').to_string();
        Ok(Self {
            config,
            client,
            base_url,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn create_body(&self, spec: &CreateSpec, image: &str) -> serde_json::Value {
        let port_key = format!("{}/tcp", spec.port);
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let mut labels: HashMap<String, String> = spec
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        labels.insert(PORT_LABEL.to_string(), spec.port.to_string());
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        let mut host_config = json!({
            "RestartPolicy": { "Name": "no" },
        });
        if let Some(mb) = spec.memory_limit_mb {
            host_config["Memory"] = json!(mb * 1024 * 1024);
        }
        if let Some(cpus) = spec.cpu_limit {
            host_config["NanoCpus"] = json!((cpus * 1e9) as u64);
        }
        if self.config.publish_ports {
            let mut bindings = serde_json::Map::new();
            bindings.insert(
                port_key.clone(),
                json!([{ "HostIp": "127.0.0.1", "HostPort": "" }]),
            );
            host_config["PortBindings"] = serde_json::Value::Object(bindings);
        }
        if let Some(network) = &self.config.network {
            host_config["NetworkMode"] = json!(network);
        }

        let mut exposed = serde_json::Map::new();
        exposed.insert(port_key, json!({}));

        let mut body = json!({
            "Image": image,
            "Env": env,
            "Labels": labels,
            "ExposedPorts": exposed,
            "HostConfig": host_config,
        });
        if !spec.command.is_empty() {
            body["Cmd"] = json!(spec.command);
        }
        body
    }

    async fn lifecycle_call(&self, handle: &RuntimeHandle, action: &str) -> Result<(), RuntimeError> {
        let path = match action {
            "start" => format!("/containers/{}/start", handle),
            other => format!("/containers/{}/{}?t={}", handle, other, STOP_TIMEOUT_SECS),
        };
        let resp = self
            .client
            .post(self.url(&path))
            .send()
            .await
            .map_err(|e| RuntimeError::Lifecycle(format!("{} {}: {}", action, handle, e)))?;

        match resp.status() {
            // 304: already in the requested state
            StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED => {
                info!(handle = %handle, action, "container lifecycle action applied");
                Ok(())
            }
            status => {
                let message = error_message(resp).await;
                Err(RuntimeError::Lifecycle(format!(
                    "{} {} returned {}: {}",
                    action, handle, status, message
                )))
            }
        }
    }

    async fn inspect_container(&self, handle: &RuntimeHandle) -> Result<ContainerInspect, RuntimeError> {
        let resp = self
            .client
            .get(self.url(&format!("/containers/{}/json", handle)))
            .send()
            .await
            .map_err(|e| RuntimeError::Transient(format!("inspect {}: {}", handle, e)))?;

        match resp.status() {
            StatusCode::OK => resp
                .json::<ContainerInspect>()
                .await
                .map_err(|e| RuntimeError::Transient(format!("decode inspect {}: {}", handle, e))),
            StatusCode::NOT_FOUND => Err(RuntimeError::NotFound(handle.to_string())),
            status => Err(RuntimeError::Transient(format!(
                "inspect {} returned {}: {}",
                handle,
                status,
                error_message(resp).await
            ))),
        }
    }

    /// One-shot stats sample. Best effort: failures leave usage unset.
    async fn stats(&self, handle: &RuntimeHandle) -> Option<ContainerStats> {
        let resp = self
            .client
            .get(self.url(&format!("/containers/{}/stats?stream=false", handle)))
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            debug!(handle = %handle, status = %resp.status(), "container stats unavailable");
            return None;
        }
        resp.json::<ContainerStats>().await.ok()
    }
}

#[async_trait]
impl Runtime for ContainerRuntime {
    fn kind(&self) -> &'static str {
        BACKEND
    }

    async fn create(&self, bot_name: &str, spec: &CreateSpec) -> Result<RuntimeHandle, RuntimeError> {
        let image = spec
            .image
            .as_deref()
            .filter(|i| !i.is_empty())
            .ok_or_else(|| RuntimeError::Provision("container backend requires an image".into()))?;

        let name = format!("bot-{}-{}", sanitize_name(bot_name), &Uuid::new_v4().simple().to_string()[..8]);
        let resp = self
            .client
            .post(self.url("/containers/create"))
            .query(&[("name", name.as_str())])
            .json(&self.create_body(spec, image))
            .send()
            .await
            .map_err(|e| RuntimeError::Provision(format!("docker unreachable: {}", e)))?;

        match resp.status() {
            StatusCode::CREATED => {
                let created: ContainerCreated = resp
                    .json()
                    .await
                    .map_err(|e| RuntimeError::Provision(format!("decode create response: {}", e)))?;
                for warning in created.warnings.unwrap_or_default() {
                    warn!(container = %name, "docker: {}", warning);
                }
                info!(container = %name, id = %created.id, image, "container created");
                Ok(RuntimeHandle::new(created.id))
            }
            StatusCode::NOT_FOUND => Err(RuntimeError::Provision(format!(
                "image {} unavailable: {}",
                image,
                error_message(resp).await
            ))),
            status => Err(RuntimeError::Provision(format!(
                "create returned {}: {}",
                status,
                error_message(resp).await
            ))),
        }
    }

    async fn start(&self, handle: &RuntimeHandle) -> Result<(), RuntimeError> {
        self.lifecycle_call(handle, "start").await
    }

    async fn stop(&self, handle: &RuntimeHandle) -> Result<(), RuntimeError> {
        self.lifecycle_call(handle, "stop").await
    }

    async fn restart(&self, handle: &RuntimeHandle) -> Result<(), RuntimeError> {
        self.lifecycle_call(handle, "restart").await
    }

    async fn inspect(&self, handle: &RuntimeHandle) -> Result<StatusSnapshot, RuntimeError> {
        let info = self.inspect_container(handle).await?;
        let mut snapshot = StatusSnapshot::for_handle(handle);

        snapshot.started_at = docker_time(&info.state.started_at);
        snapshot.ip_address = info.network.container_ip(self.config.network.as_deref());
        snapshot.host_port = info
            .bot_port()
            .and_then(|port| info.network.published_port(port))
            .map(|(_, port)| port);

        if info.state.running {
            let health = info.state.health.as_ref().map(|h| h.status.as_str());
            snapshot.healthy = matches!(health, None | Some("healthy"));
            if !snapshot.healthy {
                snapshot.error_message = health.map(|h| format!("container health: {}", h));
            }
            if let Some(stats) = self.stats(handle).await {
                snapshot.cpu_usage = stats.cpu_percent();
                snapshot.memory_usage = stats.memory_stats.usage;
            }
        } else {
            snapshot.stopped_at = docker_time(&info.state.finished_at);
            snapshot.error_message = Some(match info.state.error.as_deref().filter(|e| !e.is_empty()) {
                Some(err) => format!("container {}: {}", info.state.status, err),
                None => format!("container {} (exit code {})", info.state.status, info.state.exit_code),
            });
        }

        Ok(snapshot)
    }

    async fn resolve_endpoint(&self, handle: &RuntimeHandle) -> Result<Option<Endpoint>, RuntimeError> {
        let info = self.inspect_container(handle).await?;
        if !info.state.running {
            return Ok(None);
        }
        let Some(port) = info.bot_port() else {
            return Ok(None);
        };

        if let Some((host_ip, host_port)) = info.network.published_port(port) {
            let host = match host_ip.as_str() {
                "" | "0.0.0.0" | "::" => "127.0.0.1".to_string(),
                ip => ip.to_string(),
            };
            return Ok(Some(Endpoint::http(host, host_port)));
        }

        Ok(info
            .network
            .container_ip(self.config.network.as_deref())
            .map(|ip| Endpoint::http(ip, port)))
    }
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let trimmed = cleaned.trim_matches('-');
    if trimmed.is_empty() {
        "bot".to_string()
    } else {
        trimmed.chars().take(40).collect()
    }
}

/// Docker reports unset times as year 1
fn docker_time(raw: &Option<String>) -> Option<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw.as_deref()?).ok()?;
    if parsed.timestamp() <= 0 {
        return None;
    }
    Some(parsed.with_timezone(&Utc))
}

async fn error_message(resp: reqwest::Response) -> String {
    #[derive(Deserialize)]
    struct DockerError {
        message: String,
    }
    let text = resp.text().await.unwrap_or_default();
    serde_json::from_str::<DockerError>(&text)
        .map(|e| e.message)
        .unwrap_or(text)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerCreated {
    id: String,
    #[serde(default)]
    warnings: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspect {
    state: ContainerState,
    #[serde(default)]
    config: Option<ContainerConfig>,
    #[serde(default, rename = "NetworkSettings")]
    network: NetworkSettings,
}

impl ContainerInspect {
    fn bot_port(&self) -> Option<u16> {
        self.config
            .as_ref()?
            .labels
            .as_ref()?
            .get(PORT_LABEL)?
            .parse()
            .ok()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerState {
    #[serde(default)]
    status: String,
    #[serde(default)]
    running: bool,
    #[serde(default)]
    exit_code: i64,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    started_at: Option<String>,
    #[serde(default)]
    finished_at: Option<String>,
    #[serde(default)]
    health: Option<ContainerHealth>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerHealth {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerConfig {
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkSettings {
    #[serde(default, rename = "IPAddress")]
    ip_address: Option<String>,
    #[serde(default)]
    ports: Option<HashMap<String, Option<Vec<PortBinding>>>>,
    #[serde(default)]
    networks: Option<BTreeMap<String, NetworkEndpoint>>,
}

impl NetworkSettings {
    /// Address on `preferred` when the container is attached to it, otherwise the
    /// default bridge address, otherwise the first attached network by name.
    fn container_ip(&self, preferred: Option<&str>) -> Option<String> {
        let non_empty = |ip: &Option<String>| ip.clone().filter(|s| !s.is_empty());
        let networks = self.networks.as_ref();

        preferred
            .and_then(|name| networks?.get(name))
            .and_then(|n| non_empty(&n.ip_address))
            .or_else(|| non_empty(&self.ip_address))
            .or_else(|| networks?.values().find_map(|n| non_empty(&n.ip_address)))
    }

    fn published_port(&self, container_port: u16) -> Option<(String, u16)> {
        let bindings = self
            .ports
            .as_ref()?
            .get(&format!("{}/tcp", container_port))?
            .as_ref()?;
        bindings.iter().find_map(|b| {
            let port = b.host_port.parse().ok()?;
            Some((b.host_ip.clone(), port))
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PortBinding {
    #[serde(default)]
    host_ip: String,
    #[serde(default)]
    host_port: String,
}

#[derive(Debug, Deserialize)]
struct NetworkEndpoint {
    #[serde(default, rename = "IPAddress")]
    ip_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContainerStats {
    cpu_stats: CpuStats,
    precpu_stats: CpuStats,
    #[serde(default)]
    memory_stats: MemoryStats,
}

impl ContainerStats {
    fn cpu_percent(&self) -> Option<f64> {
        let cpu_delta = self
            .cpu_stats
            .cpu_usage
            .total_usage
            .checked_sub(self.precpu_stats.cpu_usage.total_usage)?;
        let system_delta = self
            .cpu_stats
            .system_cpu_usage?
            .checked_sub(self.precpu_stats.system_cpu_usage.unwrap_or(0))?;
        if system_delta == 0 {
            return None;
        }
        let cpus = self.cpu_stats.online_cpus.unwrap_or(1).max(1) as f64;
        Some(cpu_delta as f64 / system_delta as f64 * cpus * 100.0)
    }
}

#[derive(Debug, Default, Deserialize)]
struct CpuStats {
    #[serde(default)]
    cpu_usage: CpuUsage,
    #[serde(default)]
    system_cpu_usage: Option<u64>,
    #[serde(default)]
    online_cpus: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct CpuUsage {
    #[serde(default)]
    total_usage: u64,
}

#[derive(Debug, Default, Deserialize)]
struct MemoryStats {
    #[serde(default)]
    usage: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn runtime(server: &MockServer) -> ContainerRuntime {
        ContainerRuntime::new(ContainerBackendConfig {
            api_url: server.uri(),
            ..ContainerBackendConfig::default()
        })
        .unwrap()
    }

    fn running_inspect(id: &str) -> serde_json::Value {
        json!({
            "Id": id,
            "State": {
                "Status": "running",
                "Running": true,
                "ExitCode": 0,
                "StartedAt": "2026-10-01T12:00:00.123456789Z",
                "FinishedAt": "0001-01-01T00:00:00Z"
            },
            "Config": { "Labels": { "fleet.bot-port": "8080" } },
            "NetworkSettings": {
                "IPAddress": "",
                "Ports": { "8080/tcp": null },
                "Networks": { "bots": { "IPAddress": "172.18.0.5" } }
            }
        })
    }

    #[tokio::test]
    async fn test_create_then_inspect_reports_same_handle() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/containers/create"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"Id": "c0ffee", "Warnings": []})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/containers/c0ffee/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(running_inspect("c0ffee")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/containers/c0ffee/stats"))
            .and(query_param("stream", "false"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "cpu_stats": { "cpu_usage": { "total_usage": 400 }, "system_cpu_usage": 2000, "online_cpus": 2 },
                "precpu_stats": { "cpu_usage": { "total_usage": 200 }, "system_cpu_usage": 1000 },
                "memory_stats": { "usage": 52428800 }
            })))
            .mount(&server)
            .await;

        let rt = runtime(&server).await;
        let spec = CreateSpec {
            image: Some("bots/freqtrade:stable".into()),
            ..CreateSpec::default()
        };
        let handle = rt.create("Alpha Bot", &spec).await.unwrap();
        assert_eq!(handle.as_str(), "c0ffee");

        let snap = rt.inspect(&handle).await.unwrap();
        assert_eq!(snap.backend_handle.as_deref(), Some("c0ffee"));
        assert!(snap.healthy);
        assert_eq!(snap.ip_address.as_deref(), Some("172.18.0.5"));
        assert!(snap.started_at.is_some());
        assert!(snap.stopped_at.is_none());
        assert_eq!(snap.memory_usage, Some(52_428_800));
        assert!((snap.cpu_usage.unwrap() - 40.0).abs() < 1e-9);

        let endpoint = rt.resolve_endpoint(&handle).await.unwrap().unwrap();
        assert_eq!(endpoint, Endpoint::http("172.18.0.5", 8080));
    }

    #[tokio::test]
    async fn test_published_port_is_preferred() {
        let server = MockServer::start().await;
        let mut body = running_inspect("abc");
        body["NetworkSettings"]["Ports"] = json!({
            "8080/tcp": [{ "HostIp": "0.0.0.0", "HostPort": "49153" }]
        });
        Mock::given(method("GET"))
            .and(path("/containers/abc/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let rt = runtime(&server).await;
        let endpoint = rt
            .resolve_endpoint(&RuntimeHandle::new("abc"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(endpoint, Endpoint::http("127.0.0.1", 49153));
    }

    #[tokio::test]
    async fn test_missing_image_is_a_provision_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/containers/create"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "No such image: nope:latest"})))
            .mount(&server)
            .await;

        let rt = runtime(&server).await;
        let spec = CreateSpec {
            image: Some("nope:latest".into()),
            ..CreateSpec::default()
        };
        match rt.create("x", &spec).await {
            Err(RuntimeError::Provision(msg)) => assert!(msg.contains("No such image")),
            other => panic!("expected provision error, got {:?}", other),
        }

        let no_image = rt.create("x", &CreateSpec::default()).await;
        assert!(matches!(no_image, Err(RuntimeError::Provision(_))));
    }

    #[tokio::test]
    async fn test_inspect_unknown_container_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/containers/gone/json"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "No such container: gone"})))
            .mount(&server)
            .await;

        let rt = runtime(&server).await;
        let err = rt.inspect(&RuntimeHandle::new("gone")).await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unreachable_daemon_is_transient() {
        let rt = ContainerRuntime::new(ContainerBackendConfig {
            api_url: "http://127.0.0.1:9".into(),
            request_timeout_secs: 2,
            ..ContainerBackendConfig::default()
        })
        .unwrap();
        let err = rt.inspect(&RuntimeHandle::new("any")).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Transient(_)));
    }

    #[tokio::test]
    async fn test_stopped_container_has_no_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/containers/dead/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "State": {
                    "Status": "exited",
                    "Running": false,
                    "ExitCode": 137,
                    "StartedAt": "2026-10-01T12:00:00Z",
                    "FinishedAt": "2026-10-01T13:00:00Z"
                },
                "Config": { "Labels": { "fleet.bot-port": "8080" } },
                "NetworkSettings": {}
            })))
            .mount(&server)
            .await;

        let rt = runtime(&server).await;
        let handle = RuntimeHandle::new("dead");
        assert!(rt.resolve_endpoint(&handle).await.unwrap().is_none());
        let snap = rt.inspect(&handle).await.unwrap();
        assert!(!snap.healthy);
        assert!(snap.stopped_at.is_some());
        assert_eq!(snap.error_message.as_deref(), Some("container exited (exit code 137)"));
    }

    #[tokio::test]
    async fn test_lifecycle_maps_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/containers/abc/start"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/containers/abc/stop"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({"message": "daemon busy"})))
            .mount(&server)
            .await;

        let rt = runtime(&server).await;
        let handle = RuntimeHandle::new("abc");
        rt.start(&handle).await.unwrap();
        match rt.stop(&handle).await {
            Err(RuntimeError::Lifecycle(msg)) => assert!(msg.contains("daemon busy")),
            other => panic!("expected lifecycle error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_configured_network_wins_on_multi_homed_container() {
        let server = MockServer::start().await;
        let mut body = running_inspect("multi");
        body["NetworkSettings"]["Networks"] = json!({
            "aaa-monitoring": { "IPAddress": "10.9.0.4" },
            "bots": { "IPAddress": "172.18.0.5" },
            "zzz-legacy": { "IPAddress": "192.168.7.2" }
        });
        Mock::given(method("GET"))
            .and(path("/containers/multi/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let rt = ContainerRuntime::new(ContainerBackendConfig {
            api_url: server.uri(),
            network: Some("bots".into()),
            ..ContainerBackendConfig::default()
        })
        .unwrap();
        let handle = RuntimeHandle::new("multi");
        for _ in 0..3 {
            let endpoint = rt.resolve_endpoint(&handle).await.unwrap().unwrap();
            assert_eq!(endpoint, Endpoint::http("172.18.0.5", 8080));
        }

        // without a configured network the pick is stable: first by name
        let rt = runtime(&server).await;
        let endpoint = rt.resolve_endpoint(&handle).await.unwrap().unwrap();
        assert_eq!(endpoint, Endpoint::http("10.9.0.4", 8080));
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("Alpha Bot #1"), "alpha-bot--1");
        assert_eq!(sanitize_name("***"), "bot");
    }
}
