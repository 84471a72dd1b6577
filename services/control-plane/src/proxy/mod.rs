//! Reverse proxy to a bot's own HTTP API
//!
//! `/v1/bot/{id}/{*path}` resolves the bot's current endpoint through its backend
//! and forwards the request there. Bodies stream in both directions and upgrade
//! requests (WebSocket) are spliced through once the bot answers `101`. Nothing
//! is cached between requests apart from pooled upstream connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, Version};
use axum::response::{IntoResponse, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, RuntimeError};
use crate::models::Endpoint;
use crate::observability::{metrics, MetricsCollector};
use crate::runtime::RuntimeRegistry;
use crate::store::BotStore;
use crate::AppState;

/// Headers that describe one connection and never cross a proxy
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

#[derive(Clone)]
pub struct BotProxy {
    store: Arc<dyn BotStore>,
    registry: Arc<RuntimeRegistry>,
    client: Client<HttpConnector, Body>,
    config: ProxyConfig,
    metrics: MetricsCollector,
}

impl BotProxy {
    pub fn new(
        store: Arc<dyn BotStore>,
        registry: Arc<RuntimeRegistry>,
        config: ProxyConfig,
        metrics: MetricsCollector,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(config.connect_timeout_secs)));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_secs))
            .build(connector);

        Self {
            store,
            registry,
            client,
            config,
            metrics,
        }
    }

    /// Upstream response-header timeout for a bot sub-path: the longest configured
    /// prefix wins, otherwise the default.
    pub fn timeout_for(&self, sub_path: &str) -> Duration {
        let secs = self
            .config
            .route_timeouts
            .iter()
            .filter(|(prefix, _)| sub_path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, secs)| *secs)
            .unwrap_or(self.config.response_timeout_secs);
        Duration::from_secs(secs)
    }

    async fn resolve(&self, bot_id: &str) -> Result<Endpoint, ProxyError> {
        let unknown = || ProxyError::UnknownBot {
            bot_id: bot_id.to_string(),
        };
        let unresolvable = |reason: String| ProxyError::Unresolvable {
            bot_id: bot_id.to_string(),
            reason,
            retry_after_secs: self.config.retry_after_secs,
        };

        let id = Uuid::parse_str(bot_id).map_err(|_| unknown())?;
        let bot = self
            .store
            .get_bot(id)
            .await
            .map_err(|e| unresolvable(format!("bot store unavailable: {}", e)))?
            .ok_or_else(unknown)?;

        let handle = bot
            .runtime_handle
            .ok_or_else(|| unresolvable("bot has not been provisioned".to_string()))?;
        let runtime = self
            .registry
            .get(&bot.backend)
            .ok_or_else(|| unresolvable(format!("backend '{}' is not available", bot.backend)))?;

        match runtime.resolve_endpoint(&handle).await {
            Ok(Some(endpoint)) => Ok(endpoint),
            Ok(None) => Err(unresolvable("bot is not running".to_string())),
            Err(RuntimeError::NotFound(_)) => Err(unresolvable("bot instance is gone".to_string())),
            Err(e) => Err(unresolvable(e.to_string())),
        }
    }

    /// Forward `req` to `sub_path` on the bot's API
    pub async fn forward(
        &self,
        bot_id: &str,
        sub_path: &str,
        mut req: Request,
    ) -> Result<Response, ProxyError> {
        self.metrics.increment(metrics::PROXY_REQUESTS, 1).await;

        let endpoint = match self.resolve(bot_id).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                if matches!(e, ProxyError::Unresolvable { .. }) {
                    self.metrics.increment(metrics::PROXY_UNRESOLVABLE, 1).await;
                }
                return Err(e);
            }
        };

        let uri = upstream_uri(&endpoint, sub_path, req.uri().query()).map_err(|reason| {
            ProxyError::BadRequest {
                bot_id: bot_id.to_string(),
                reason,
            }
        })?;

        let upgrade = is_upgrade(req.headers());
        let client_upgrade = upgrade.then(|| hyper::upgrade::on(&mut req));
        let client_addr = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        let (parts, body) = req.into_parts();
        let mut headers = parts.headers;
        let original_host = headers.get(header::HOST).cloned();
        strip_hop_by_hop(&mut headers, upgrade);

        if let Ok(host) = HeaderValue::from_str(&endpoint.authority()) {
            headers.insert(header::HOST, host);
        }
        if let Some(host) = original_host {
            headers.insert(X_FORWARDED_HOST, host);
        }
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
        if let Some(ip) = client_addr {
            let forwarded = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(prior) => format!("{}, {}", prior, ip),
                None => ip.to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }

        let mut upstream_req = axum::http::Request::new(body);
        *upstream_req.method_mut() = parts.method;
        *upstream_req.uri_mut() = uri;
        *upstream_req.version_mut() = Version::HTTP_11;
        *upstream_req.headers_mut() = headers;

        let timeout = self.timeout_for(sub_path);
        let mut upstream_resp = match tokio::time::timeout(timeout, self.client.request(upstream_req)).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                self.metrics.increment(metrics::PROXY_UPSTREAM_ERRORS, 1).await;
                warn!(bot_id = %bot_id, upstream = %endpoint.authority(), error = %e, "upstream request failed");
                return Err(ProxyError::UpstreamConnect {
                    bot_id: bot_id.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                self.metrics.increment(metrics::PROXY_UPSTREAM_ERRORS, 1).await;
                warn!(bot_id = %bot_id, upstream = %endpoint.authority(), timeout = ?timeout, "upstream timed out");
                return Err(ProxyError::UpstreamTimeout {
                    bot_id: bot_id.to_string(),
                    timeout,
                });
            }
        };

        let switching = upstream_resp.status() == StatusCode::SWITCHING_PROTOCOLS;
        if let (true, Some(client_upgrade)) = (switching, client_upgrade) {
            let upstream_upgrade = hyper::upgrade::on(&mut upstream_resp);
            let bot_id = bot_id.to_string();
            self.metrics.increment(metrics::PROXY_UPGRADES, 1).await;
            tokio::spawn(async move {
                let (client, upstream) = match tokio::try_join!(client_upgrade, upstream_upgrade) {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(bot_id = %bot_id, error = %e, "connection upgrade failed");
                        return;
                    }
                };
                let mut client = TokioIo::new(client);
                let mut upstream = TokioIo::new(upstream);
                match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                    Ok((sent, received)) => {
                        debug!(bot_id = %bot_id, sent, received, "upgraded connection closed")
                    }
                    Err(e) => debug!(bot_id = %bot_id, error = %e, "upgraded connection ended"),
                }
            });
        }

        let (mut parts, body) = upstream_resp.into_parts();
        strip_hop_by_hop(&mut parts.headers, switching);
        Ok(Response::from_parts(parts, Body::new(body)))
    }
}

/// `ANY /v1/bot/{id}`
pub async fn proxy_root(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<String>,
    req: Request,
) -> Response {
    state
        .proxy
        .forward(&bot_id, "/", req)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

/// `ANY /v1/bot/{id}/{*path}`
pub async fn proxy_path(
    State(state): State<Arc<AppState>>,
    Path((bot_id, _)): Path<(String, String)>,
    req: Request,
) -> Response {
    // forward the path as the client encoded it; the extracted one is percent-decoded
    let sub_path = raw_sub_path(req.uri().path()).to_string();
    let result = state.proxy.forward(&bot_id, &sub_path, req).await;
    if let Err(e) = &result {
        info!(bot_id = %bot_id, path = %sub_path, status = %e.status_code(), error = %e, "proxy request failed");
    }
    result.unwrap_or_else(IntoResponse::into_response)
}

/// Whatever follows `/bot/{id}` in a request path, `/` when nothing does
fn raw_sub_path(path: &str) -> &str {
    let after_bot = match path.find("/bot/") {
        Some(i) => &path[i + "/bot/".len()..],
        None => path.trim_start_matches('/'),
    };
    match after_bot.find('/') {
        Some(i) => &after_bot[i..],
        None => "/",
    }
}

fn upstream_uri(endpoint: &Endpoint, sub_path: &str, query: Option<&str>) -> Result<Uri, String> {
    let mut uri = format!("{}{}", endpoint.base_url(), sub_path);
    if let Some(q) = query {
        uri.push('?');
        uri.push_str(q);
    }
    uri.parse::<Uri>().map_err(|e| format!("invalid upstream path: {}", e))
}

fn is_upgrade(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE)
        && headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Remove hop-by-hop headers, including any named in `Connection`. An upgrade
/// keeps `Connection: upgrade` and `Upgrade` so the handshake reaches the other side.
fn strip_hop_by_hop(headers: &mut HeaderMap, upgrade: bool) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    let upgrade_value = headers.get(header::UPGRADE).cloned();

    for name in &named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }

    if upgrade {
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        if let Some(value) = upgrade_value {
            headers.insert(header::UPGRADE, value);
        }
    }
}
