//! Observability: tracing setup, metrics collection and structured logging

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `logging.level` when set.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json {
        registry.with(fmt::layer().json().with_current_span(false)).try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    if let Err(e) = result {
        eprintln!("tracing already initialized: {}", e);
    }
}

/// Metrics collector for tracking system health
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<RwLock<MetricsInner>>,
}

struct MetricsInner {
    counters: HashMap<String, u64>,
    gauges: HashMap<String, f64>,
    histograms: HashMap<String, Vec<f64>>,
    start_time: Instant,
}

/// Bound on retained histogram samples per metric
const HISTOGRAM_WINDOW: usize = 1024;

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(MetricsInner {
                counters: HashMap::new(),
                gauges: HashMap::new(),
                histograms: HashMap::new(),
                start_time: Instant::now(),
            })),
        }
    }

    /// Increment a counter
    pub async fn increment(&self, name: &str, value: u64) {
        let mut inner = self.inner.write().await;
        let counter = inner.counters.entry(name.to_string()).or_insert(0);
        *counter += value;
    }

    /// Set a gauge value
    pub async fn gauge(&self, name: &str, value: f64) {
        let mut inner = self.inner.write().await;
        inner.gauges.insert(name.to_string(), value);
    }

    /// Record a histogram value
    pub async fn histogram(&self, name: &str, value: f64) {
        let mut inner = self.inner.write().await;
        let samples = inner.histograms.entry(name.to_string()).or_default();
        if samples.len() >= HISTOGRAM_WINDOW {
            samples.remove(0);
        }
        samples.push(value);
    }

    /// Get all metrics as JSON-serializable format
    pub async fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.read().await;
        let histograms = inner
            .histograms
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| {
                let sum: f64 = v.iter().sum();
                let max = v.iter().cloned().fold(f64::MIN, f64::max);
                (
                    k.clone(),
                    HistogramSummary {
                        count: v.len(),
                        mean: sum / v.len() as f64,
                        max,
                    },
                )
            })
            .collect();
        MetricsSnapshot {
            counters: inner.counters.clone(),
            gauges: inner.gauges.clone(),
            histograms,
            uptime_secs: inner.start_time.elapsed().as_secs(),
        }
    }

    /// Get specific counter
    pub async fn get_counter(&self, name: &str) -> u64 {
        let inner = self.inner.read().await;
        inner.counters.get(name).copied().unwrap_or(0)
    }

    pub async fn get_gauge(&self, name: &str) -> Option<f64> {
        self.inner.read().await.gauges.get(name).copied()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable metrics snapshot
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
    pub histograms: HashMap<String, HistogramSummary>,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HistogramSummary {
    pub count: usize,
    pub mean: f64,
    pub max: f64,
}

/// Structured logger for consistent log formatting
pub struct Logger;

impl Logger {
    /// Log bot event
    pub fn bot_event(bot_id: &str, event_type: &str, details: &str) {
        tracing::info!(
            bot_id = %bot_id,
            event_type = %event_type,
            details = %details,
            "bot_event"
        );
    }

    /// Log a change in the monitor's view of live replicas
    pub fn membership_event(instance_id: &str, event_type: &str, members: &[String]) {
        tracing::info!(
            instance_id = %instance_id,
            event_type = %event_type,
            member_count = members.len(),
            members = %members.join(","),
            "membership_event"
        );
    }
}

/// Predefined metric names
pub mod metrics {
    // Monitor
    pub const MONITOR_TICKS: &str = "monitor_ticks_total";
    pub const MONITOR_TICK_DURATION_MS: &str = "monitor_tick_duration_ms";
    pub const MONITOR_OWNED_BOTS: &str = "monitor_owned_bots";
    pub const BOT_CHECKS: &str = "bot_checks_total";
    pub const BOT_CHECK_FAILURES: &str = "bot_check_failures_total";
    pub const BOT_CHECK_TIMEOUTS: &str = "bot_check_timeouts_total";
    pub const SNAPSHOT_WRITE_ERRORS: &str = "snapshot_write_errors_total";

    // Membership
    pub const MEMBERSHIP_CHANGES: &str = "membership_changes_total";
    pub const LIVE_MEMBERS: &str = "live_members";
    pub const LEASE_RENEWAL_FAILURES: &str = "lease_renewal_failures_total";
    pub const LEASE_REGRANTS: &str = "lease_regrants_total";

    // Proxy
    pub const PROXY_REQUESTS: &str = "proxy_requests_total";
    pub const PROXY_UPSTREAM_ERRORS: &str = "proxy_upstream_errors_total";
    pub const PROXY_UNRESOLVABLE: &str = "proxy_unresolvable_total";
    pub const PROXY_UPGRADES: &str = "proxy_upgrades_total";

    // Lifecycle
    pub const BOT_PROVISION_SUCCESS: &str = "bot_provision_success_total";
    pub const BOT_PROVISION_FAILED: &str = "bot_provision_failed_total";
    pub const BOT_ACTIONS: &str = "bot_actions_total";

    // Data preparation
    pub const DATA_PREP_JOBS: &str = "data_prep_jobs_total";
    pub const DATA_PREP_FAILURES: &str = "data_prep_failures_total";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters_accumulate() {
        let m = MetricsCollector::new();
        m.increment(metrics::BOT_CHECKS, 3).await;
        m.increment(metrics::BOT_CHECKS, 2).await;
        assert_eq!(m.get_counter(metrics::BOT_CHECKS).await, 5);
        assert_eq!(m.get_counter(metrics::PROXY_REQUESTS).await, 0);
    }

    #[tokio::test]
    async fn test_histogram_summary() {
        let m = MetricsCollector::new();
        m.histogram(metrics::MONITOR_TICK_DURATION_MS, 10.0).await;
        m.histogram(metrics::MONITOR_TICK_DURATION_MS, 30.0).await;
        let snap = m.snapshot().await;
        let h = &snap.histograms[metrics::MONITOR_TICK_DURATION_MS];
        assert_eq!(h.count, 2);
        assert_eq!(h.mean, 20.0);
        assert_eq!(h.max, 30.0);
    }
}
