//! Cluster backend (Kubernetes API)
//!
//! `create` allocates a ClusterIP Service for the bot and stores the Pod manifest
//! on it as an annotation; `start` creates the Pod from that manifest and `stop`
//! deletes it, leaving the Service (and therefore the bot's address) in place.
//! The proxy reaches bots through the Service DNS name.

use std::collections::BTreeMap;
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
use crate::config::ClusterBackendConfig;
use crate::error::RuntimeError;
use crate::models::{CreateSpec, Endpoint, RuntimeHandle, StatusSnapshot};

pub const BACKEND: &str = "cluster";

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const MANIFEST_ANNOTATION: &str = "fleet.trading/pod-manifest";
const BOT_LABEL: &str = "fleet.trading/bot";
const MANAGED_BY: &str = "fleet-control";
const POD_GONE_POLLS: u32 = 30;

pub fn register(builder: &mut RegistryBuilder) {
    builder.register(BACKEND, |config| {
        if !config.cluster.enabled || config.cluster.api_url.is_empty() {
            return Ok(None);
        }
        let runtime = ClusterRuntime::new(config.cluster.clone())?;
        Ok(Some(Arc::new(runtime) as Arc<dyn Runtime>))
    });
}

pub struct ClusterRuntime {
    config: ClusterBackendConfig,
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    poll_interval: Duration,
}

impl ClusterRuntime {
    pub fn new(config: ClusterBackendConfig) -> Result<Self, RuntimeError> {
        let mut builder =
            reqwest::Client::builder().timeout(Duration::from_secs(config.request_timeout_secs));

        // In-cluster: trust the service account CA
        if let Ok(pem) = std::fs::read(format!("{}/ca.crt", SERVICE_ACCOUNT_DIR)) {
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| RuntimeError::Provision(format!("cluster CA: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| RuntimeError::Provision(format!("cluster client: {}", e)))?;

        let token = config.token.clone().filter(|t| !t.is_empty()).or_else(|| {
            std::fs::read_to_string(format!("{}/token", SERVICE_ACCOUNT_DIR))
                .ok()
                .map(|t| t.trim().to_string())
        });

        let base_url = config.api_url.trim_end_matches('/').to_string();
        Ok(Self {
            config,
            client,
            base_url,
            token,
            poll_interval: Duration::from_secs(1),
        })
    }

    fn namespaced(&self, kind: &str, name: Option<&str>) -> String {
        let base = format!("{}/api/v1/namespaces/{}/{}", self.base_url, self.config.namespace, kind);
        match name {
            Some(name) => format!("{}/{}", base, name),
            None => base,
        }
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let req = self.client.request(method, url);
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn service_host(&self, name: &str) -> String {
        format!("{}.{}.svc.{}", name, self.config.namespace, self.config.cluster_domain)
    }

    fn pod_manifest(&self, name: &str, spec: &CreateSpec, image: &str) -> serde_json::Value {
        let mut labels: BTreeMap<String, String> = spec.labels.clone();
        labels.insert(BOT_LABEL.to_string(), name.to_string());
        labels.insert("app.kubernetes.io/managed-by".to_string(), MANAGED_BY.to_string());

        let env: Vec<serde_json::Value> = spec
            .env
            .iter()
            .map(|(k, v)| json!({ "name": k, "value": v }))
            .collect();

        let mut limits = serde_json::Map::new();
        if let Some(cpu) = spec.cpu_limit {
            limits.insert("cpu".to_string(), json!(format!("{}m", (cpu * 1000.0) as u64)));
        }
        if let Some(mb) = spec.memory_limit_mb {
            limits.insert("memory".to_string(), json!(format!("{}Mi", mb)));
        }

        let mut container = json!({
            "name": "bot",
            "image": image,
            "env": env,
            "ports": [{ "name": "http", "containerPort": spec.port }],
            "resources": { "limits": limits },
        });
        if !spec.command.is_empty() {
            container["command"] = json!(spec.command);
        }

        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": name, "labels": labels },
            "spec": {
                "restartPolicy": "Always",
                "containers": [container],
            },
        })
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>, RuntimeError> {
        let resp = self
            .request(reqwest::Method::GET, self.namespaced("pods", Some(name)))
            .send()
            .await
            .map_err(|e| RuntimeError::Transient(format!("get pod {}: {}", name, e)))?;
        match resp.status() {
            StatusCode::OK => resp
                .json::<Pod>()
                .await
                .map(Some)
                .map_err(|e| RuntimeError::Transient(format!("decode pod {}: {}", name, e))),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(RuntimeError::Transient(format!(
                "get pod {} returned {}: {}",
                name,
                status,
                status_message(resp).await
            ))),
        }
    }

    async fn get_service(&self, name: &str) -> Result<Option<Service>, RuntimeError> {
        let resp = self
            .request(reqwest::Method::GET, self.namespaced("services", Some(name)))
            .send()
            .await
            .map_err(|e| RuntimeError::Transient(format!("get service {}: {}", name, e)))?;
        match resp.status() {
            StatusCode::OK => resp
                .json::<Service>()
                .await
                .map(Some)
                .map_err(|e| RuntimeError::Transient(format!("decode service {}: {}", name, e))),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(RuntimeError::Transient(format!(
                "get service {} returned {}: {}",
                name,
                status,
                status_message(resp).await
            ))),
        }
    }

    async fn delete_pod(&self, name: &str, grace_secs: Option<u32>) -> Result<(), RuntimeError> {
        let mut url = self.namespaced("pods", Some(name));
        if let Some(grace) = grace_secs {
            url = format!("{}?gracePeriodSeconds={}", url, grace);
        }
        let resp = self
            .request(reqwest::Method::DELETE, url)
            .send()
            .await
            .map_err(|e| RuntimeError::Lifecycle(format!("delete pod {}: {}", name, e)))?;
        match resp.status() {
            // 404: already stopped
            StatusCode::OK | StatusCode::ACCEPTED | StatusCode::NOT_FOUND => {
                info!(pod = %name, "bot pod deleted");
                Ok(())
            }
            status => Err(RuntimeError::Lifecycle(format!(
                "delete pod {} returned {}: {}",
                name,
                status,
                status_message(resp).await
            ))),
        }
    }

    /// Create the bot pod. `Ok(false)` when a pod with that name already exists.
    async fn post_pod(&self, name: &str, manifest: &serde_json::Value) -> Result<bool, RuntimeError> {
        let resp = self
            .request(reqwest::Method::POST, self.namespaced("pods", None))
            .json(manifest)
            .send()
            .await
            .map_err(|e| RuntimeError::Lifecycle(format!("create pod {}: {}", name, e)))?;

        match resp.status() {
            StatusCode::OK | StatusCode::CREATED => {
                info!(pod = %name, "bot pod created");
                Ok(true)
            }
            StatusCode::CONFLICT => Ok(false),
            status => Err(RuntimeError::Lifecycle(format!(
                "create pod {} returned {}: {}",
                name,
                status,
                status_message(resp).await
            ))),
        }
    }

    /// Block until a deleted pod is gone so its name can be reused
    async fn wait_pod_gone(&self, name: &str) -> Result<(), RuntimeError> {
        for _ in 0..POD_GONE_POLLS {
            match self.get_pod(name).await {
                Ok(None) => return Ok(()),
                Ok(Some(_)) => tokio::time::sleep(self.poll_interval).await,
                Err(e) => return Err(RuntimeError::Lifecycle(e.to_string())),
            }
        }
        Err(RuntimeError::Lifecycle(format!("pod {} still terminating", name)))
    }

    /// Best-effort usage from metrics-server: (cpu percent of a core, memory bytes)
    async fn pod_usage(&self, name: &str) -> Option<(Option<f64>, Option<u64>)> {
        let url = format!(
            "{}/apis/metrics.k8s.io/v1beta1/namespaces/{}/pods/{}",
            self.base_url, self.config.namespace, name
        );
        let resp = self.request(reqwest::Method::GET, url).send().await.ok()?;
        if !resp.status().is_success() {
            debug!(pod = %name, status = %resp.status(), "pod metrics unavailable");
            return None;
        }
        let metrics: PodMetrics = resp.json().await.ok()?;
        let mut cpu = None;
        let mut memory = None;
        for c in metrics.containers {
            if let Some(cores) = c.usage.get("cpu").and_then(|q| parse_cpu_quantity(q)) {
                cpu = Some(cpu.unwrap_or(0.0) + cores * 100.0);
            }
            if let Some(bytes) = c.usage.get("memory").and_then(|q| parse_memory_quantity(q)) {
                memory = Some(memory.unwrap_or(0) + bytes);
            }
        }
        Some((cpu, memory))
    }
}

#[async_trait]
impl Runtime for ClusterRuntime {
    fn kind(&self) -> &'static str {
        BACKEND
    }

    async fn create(&self, bot_name: &str, spec: &CreateSpec) -> Result<RuntimeHandle, RuntimeError> {
        let image = spec
            .image
            .as_deref()
            .filter(|i| !i.is_empty())
            .ok_or_else(|| RuntimeError::Provision("cluster backend requires an image".into()))?;

        let name = format!("bot-{}-{}", dns_label(bot_name), &Uuid::new_v4().simple().to_string()[..8]);
        let manifest = self.pod_manifest(&name, spec, image);

        let service = json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": name,
                "labels": { BOT_LABEL: name, "app.kubernetes.io/managed-by": MANAGED_BY },
                "annotations": { MANIFEST_ANNOTATION: manifest.to_string() },
            },
            "spec": {
                "type": "ClusterIP",
                "selector": { BOT_LABEL: name },
                "ports": [{ "name": "http", "port": spec.port, "targetPort": spec.port }],
            },
        });

        let resp = self
            .request(reqwest::Method::POST, self.namespaced("services", None))
            .json(&service)
            .send()
            .await
            .map_err(|e| RuntimeError::Provision(format!("cluster unreachable: {}", e)))?;

        match resp.status() {
            StatusCode::OK | StatusCode::CREATED => {
                info!(service = %name, image, namespace = %self.config.namespace, "bot service allocated");
                Ok(RuntimeHandle::new(name))
            }
            status => Err(RuntimeError::Provision(format!(
                "create service returned {}: {}",
                status,
                status_message(resp).await
            ))),
        }
    }

    async fn start(&self, handle: &RuntimeHandle) -> Result<(), RuntimeError> {
        let name = handle.as_str();
        let service = self
            .get_service(name)
            .await
            .map_err(|e| RuntimeError::Lifecycle(e.to_string()))?
            .ok_or_else(|| RuntimeError::Lifecycle(format!("unknown handle {}", name)))?;
        let manifest = service
            .metadata
            .annotations
            .get(MANIFEST_ANNOTATION)
            .ok_or_else(|| RuntimeError::Lifecycle(format!("service {} has no pod manifest", name)))?;
        let manifest: serde_json::Value = serde_json::from_str(manifest)
            .map_err(|e| RuntimeError::Lifecycle(format!("bad pod manifest on {}: {}", name, e)))?;

        if self.post_pod(name, &manifest).await? {
            return Ok(());
        }

        // Name taken: either the pod is up, or a previous stop is still terminating it
        let existing = self
            .get_pod(name)
            .await
            .map_err(|e| RuntimeError::Lifecycle(e.to_string()))?;
        if let Some(pod) = existing {
            if pod.metadata.deletion_timestamp.is_none() {
                debug!(pod = %name, "bot pod already exists");
                return Ok(());
            }
            info!(pod = %name, "previous bot pod still terminating; waiting to recreate");
        }

        self.wait_pod_gone(name).await?;
        if self.post_pod(name, &manifest).await? {
            Ok(())
        } else {
            Err(RuntimeError::Lifecycle(format!(
                "pod {} reappeared before it could be recreated",
                name
            )))
        }
    }

    async fn stop(&self, handle: &RuntimeHandle) -> Result<(), RuntimeError> {
        self.delete_pod(handle.as_str(), None).await
    }

    async fn restart(&self, handle: &RuntimeHandle) -> Result<(), RuntimeError> {
        self.delete_pod(handle.as_str(), Some(0)).await?;
        self.wait_pod_gone(handle.as_str()).await?;
        self.start(handle).await
    }

    async fn inspect(&self, handle: &RuntimeHandle) -> Result<StatusSnapshot, RuntimeError> {
        let name = handle.as_str();
        let mut snapshot = StatusSnapshot::for_handle(handle);

        let Some(pod) = self.get_pod(name).await? else {
            if self.get_service(name).await?.is_none() {
                return Err(RuntimeError::NotFound(name.to_string()));
            }
            snapshot.error_message = Some("pod not running".to_string());
            return Ok(snapshot);
        };

        let status = pod.status.unwrap_or_default();
        let container = status.container_statuses.first();
        let ready = container.map(|c| c.ready).unwrap_or(false);

        snapshot.ip_address = status.pod_ip.clone();
        snapshot.started_at = status.start_time;
        snapshot.healthy = status.phase == "Running" && ready;
        snapshot.stopped_at = container
            .and_then(|c| c.state.terminated.as_ref())
            .and_then(|t| t.finished_at);

        if snapshot.healthy {
            if let Some((cpu, memory)) = self.pod_usage(name).await {
                snapshot.cpu_usage = cpu;
                snapshot.memory_usage = memory;
            }
        } else {
            let waiting = container
                .and_then(|c| c.state.waiting.as_ref())
                .and_then(|w| w.reason.clone());
            snapshot.error_message = Some(match (waiting, status.message) {
                (Some(reason), _) => format!("pod {}: {}", status.phase, reason),
                (None, Some(msg)) => format!("pod {}: {}", status.phase, msg),
                (None, None) if !ready && status.phase == "Running" => "pod not ready".to_string(),
                (None, None) => format!("pod {}", status.phase),
            });
        }

        Ok(snapshot)
    }

    async fn resolve_endpoint(&self, handle: &RuntimeHandle) -> Result<Option<Endpoint>, RuntimeError> {
        let name = handle.as_str();
        let Some(pod) = self.get_pod(name).await? else {
            if self.get_service(name).await?.is_none() {
                return Err(RuntimeError::NotFound(name.to_string()));
            }
            return Ok(None);
        };

        let status = pod.status.unwrap_or_default();
        let ready = status
            .container_statuses
            .first()
            .map(|c| c.ready)
            .unwrap_or(false);
        if status.phase != "Running" || !ready {
            return Ok(None);
        }

        let Some(port) = pod.spec.and_then(|s| s.container_port()) else {
            warn!(pod = %name, "pod declares no container port");
            return Ok(None);
        };
        Ok(Some(Endpoint::http(self.service_host(name), port)))
    }
}

/// Lowercase RFC 1123 label fragment
fn dns_label(name: &str) -> String {
    let cleaned: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let trimmed: String = cleaned.trim_matches('-').chars().take(40).collect();
    let trimmed = trimmed.trim_end_matches('-').to_string();
    if trimmed.is_empty() {
        "bot".to_string()
    } else {
        trimmed
    }
}

/// "250m" -> 0.25 cores, "123456789n" -> 0.123 cores, "2" -> 2 cores
fn parse_cpu_quantity(q: &str) -> Option<f64> {
    if let Some(n) = q.strip_suffix('n') {
        return n.parse::<f64>().ok().map(|v| v / 1e9);
    }
    if let Some(u) = q.strip_suffix('u') {
        return u.parse::<f64>().ok().map(|v| v / 1e6);
    }
    if let Some(m) = q.strip_suffix('m') {
        return m.parse::<f64>().ok().map(|v| v / 1e3);
    }
    q.parse().ok()
}

/// "51200Ki" -> 52428800 bytes
fn parse_memory_quantity(q: &str) -> Option<u64> {
    const SUFFIXES: [(&str, u64); 6] = [
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("K", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
    ];
    for (suffix, factor) in SUFFIXES {
        if let Some(n) = q.strip_suffix(suffix) {
            return n.parse::<u64>().ok().map(|v| v * factor);
        }
    }
    q.parse().ok()
}

async fn status_message(resp: reqwest::Response) -> String {
    #[derive(Deserialize)]
    struct ApiStatus {
        message: String,
    }
    let text = resp.text().await.unwrap_or_default();
    serde_json::from_str::<ApiStatus>(&text)
        .map(|s| s.message)
        .unwrap_or(text)
}

#[derive(Debug, Deserialize)]
struct Pod {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    spec: Option<PodSpec>,
    #[serde(default)]
    status: Option<PodStatus>,
}

#[derive(Debug, Deserialize)]
struct PodSpec {
    #[serde(default)]
    containers: Vec<PodContainer>,
}

impl PodSpec {
    fn container_port(&self) -> Option<u16> {
        self.containers
            .iter()
            .flat_map(|c| c.ports.iter())
            .map(|p| p.container_port)
            .next()
    }
}

#[derive(Debug, Deserialize)]
struct PodContainer {
    #[serde(default)]
    ports: Vec<ContainerPort>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerPort {
    container_port: u16,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatus {
    #[serde(default)]
    phase: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "podIP")]
    pod_ip: Option<String>,
    #[serde(default)]
    start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerStatus {
    #[serde(default)]
    ready: bool,
    #[serde(default)]
    state: ContainerStateInfo,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerStateInfo {
    #[serde(default)]
    waiting: Option<StateWaiting>,
    #[serde(default)]
    terminated: Option<StateTerminated>,
}

#[derive(Debug, Deserialize)]
struct StateWaiting {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateTerminated {
    #[serde(default)]
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct Service {
    metadata: ObjectMeta,
}

#[derive(Debug, Default, Deserialize)]
struct ObjectMeta {
    #[serde(default)]
    annotations: BTreeMap<String, String>,
    /// Set once deletion has been requested; the pod lingers until its grace period ends
    #[serde(default, rename = "deletionTimestamp")]
    deletion_timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PodMetrics {
    #[serde(default)]
    containers: Vec<ContainerMetrics>,
}

#[derive(Debug, Deserialize)]
struct ContainerMetrics {
    #[serde(default)]
    usage: BTreeMap<String, String>,
}
