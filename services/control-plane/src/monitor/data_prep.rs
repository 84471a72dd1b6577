//! Long-running data preparation jobs triggered on a bot's own API
//!
//! These can take hours (historical candle downloads), so they run detached under
//! their own timeout and never occupy a health-check slot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::RuntimeError;
use crate::models::BotInstance;
use crate::observability::{metrics, Logger, MetricsCollector};
use crate::runtime::RuntimeRegistry;

#[derive(Clone)]
pub struct DataPrepRunner {
    client: reqwest::Client,
    registry: Arc<RuntimeRegistry>,
    metrics: MetricsCollector,
    timeout: Duration,
    cancel: CancellationToken,
}

impl DataPrepRunner {
    pub fn new(
        registry: Arc<RuntimeRegistry>,
        metrics: MetricsCollector,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            registry,
            metrics,
            timeout,
            cancel,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolve the bot's endpoint and start the job in the background.
    ///
    /// Fails up front when the bot has no handle or cannot be reached right now;
    /// once spawned, the outcome is only logged and counted.
    pub async fn spawn(
        &self,
        bot: &BotInstance,
        path: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<Uuid, RuntimeError> {
        let handle = bot
            .runtime_handle
            .clone()
            .ok_or_else(|| RuntimeError::Transient(format!("bot {} has no runtime handle", bot.id)))?;
        let runtime = self.registry.require(&bot.backend)?;
        let endpoint = runtime
            .resolve_endpoint(&handle)
            .await?
            .ok_or_else(|| RuntimeError::Transient(format!("bot {} is not reachable", bot.id)))?;

        let job_id = Uuid::new_v4();
        let url = format!("{}/{}", endpoint.base_url(), path.trim_start_matches('/'));
        let request = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&payload.unwrap_or(serde_json::Value::Null));

        let bot_id = bot.id;
        let metrics = self.metrics.clone();
        let cancel = self.cancel.clone();
        let timeout = self.timeout;

        info!(bot_id = %bot_id, job_id = %job_id, url = %url, "data prep job started");
        metrics.increment(metrics::DATA_PREP_JOBS, 1).await;

        tokio::spawn(async move {
            let started = Instant::now();
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(bot_id = %bot_id, job_id = %job_id, "data prep job cancelled by shutdown");
                    return;
                }
                r = request.send() => r,
            };

            match result {
                Ok(resp) if resp.status().is_success() => {
                    Logger::bot_event(
                        &bot_id.to_string(),
                        "data_prep_completed",
                        &format!("job {} in {:?}", job_id, started.elapsed()),
                    );
                }
                Ok(resp) => {
                    warn!(bot_id = %bot_id, job_id = %job_id, status = %resp.status(), "data prep job rejected by bot");
                    metrics.increment(metrics::DATA_PREP_FAILURES, 1).await;
                }
                Err(e) if e.is_timeout() => {
                    warn!(bot_id = %bot_id, job_id = %job_id, timeout = ?timeout, "data prep job timed out");
                    metrics.increment(metrics::DATA_PREP_FAILURES, 1).await;
                }
                Err(e) => {
                    warn!(bot_id = %bot_id, job_id = %job_id, error = %e, "data prep job failed");
                    metrics.increment(metrics::DATA_PREP_FAILURES, 1).await;
                }
            }
        });

        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendsConfig;
    use crate::error::RuntimeError;
    use crate::models::{CreateSpec, Endpoint, RuntimeHandle, StatusSnapshot};
    use crate::runtime::Runtime;
    use async_trait::async_trait;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct FixedEndpoint(Option<Endpoint>);

    #[async_trait]
    impl Runtime for FixedEndpoint {
        fn kind(&self) -> &'static str {
            "fixed"
        }
        async fn create(&self, _: &str, _: &CreateSpec) -> Result<RuntimeHandle, RuntimeError> {
            Ok(RuntimeHandle::new("fixed-1"))
        }
        async fn start(&self, _: &RuntimeHandle) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn stop(&self, _: &RuntimeHandle) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn restart(&self, _: &RuntimeHandle) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn inspect(&self, h: &RuntimeHandle) -> Result<StatusSnapshot, RuntimeError> {
            Ok(StatusSnapshot::for_handle(h))
        }
        async fn resolve_endpoint(&self, _: &RuntimeHandle) -> Result<Option<Endpoint>, RuntimeError> {
            Ok(self.0.clone())
        }
    }

    fn runner(endpoint: Option<Endpoint>, metrics: MetricsCollector) -> DataPrepRunner {
        let mut builder = RuntimeRegistry::builder();
        builder.register_runtime(Arc::new(FixedEndpoint(endpoint)));
        let registry = Arc::new(builder.build(&BackendsConfig::default()));
        DataPrepRunner::new(registry, metrics, Duration::from_secs(5), CancellationToken::new())
    }

    fn bot() -> BotInstance {
        BotInstance::new("alpha", "fixed", CreateSpec::default()).with_handle(RuntimeHandle::new("fixed-1"))
    }

    #[tokio::test]
    async fn test_job_posts_to_bot_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/download-data"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let addr = server.address();
        let metrics = MetricsCollector::new();
        let runner = runner(
            Some(Endpoint::http(addr.ip().to_string(), addr.port())),
            metrics.clone(),
        );
        runner
            .spawn(&bot(), "/api/v1/download-data", Some(serde_json::json!({"days": 30})))
            .await
            .unwrap();

        // the job is detached; give it a moment to land
        for _ in 0..50 {
            if !server.received_requests().await.unwrap_or_default().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(metrics.get_counter(metrics::DATA_PREP_JOBS).await, 1);
    }

    #[tokio::test]
    async fn test_unreachable_bot_fails_up_front() {
        let runner = runner(None, MetricsCollector::new());
        let err = runner.spawn(&bot(), "prep", None).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Transient(_)));
    }

    #[tokio::test]
    async fn test_bot_without_handle_fails_up_front() {
        let runner = runner(None, MetricsCollector::new());
        let bot = BotInstance::new("alpha", "fixed", CreateSpec::default());
        assert!(runner.spawn(&bot, "prep", None).await.is_err());
    }
}
