//! Health check endpoints for load balancers and monitoring

use axum::{
    extract::State,
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use serde::Serialize;

use crate::monitor::MonitorState;
use crate::observability::HistogramSummary;
use crate::AppState;

/// Basic health check - fast, no external dependencies
/// Use for load balancer health checks
pub async fn healthz() -> StatusCode {
    StatusCode::OK
}

fn monitor_running(state: MonitorState) -> bool {
    matches!(state, MonitorState::SingleInstance | MonitorState::DistributedMember)
}

/// Readiness check - bot store reachable and monitor running
/// Use for kubernetes readiness probes
pub async fn readyz(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReadinessResponse>, StatusCode> {
    if let Err(e) = state.store.ping().await {
        tracing::error!("Readiness check failed: {}", e);
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    let monitor_state = state.monitor.state();
    if !monitor_running(monitor_state) {
        tracing::warn!(state = ?monitor_state, "Readiness check failed: monitor not running");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(Json(ReadinessResponse {
        status: "ready".to_string(),
        checks: vec![
            HealthCheck {
                name: "store".to_string(),
                status: "ok".to_string(),
            },
            HealthCheck {
                name: "monitor".to_string(),
                status: "ok".to_string(),
            },
        ],
    }))
}

/// Detailed health check with all components
/// Use for debugging and monitoring dashboards
pub async fn health_detail(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DetailedHealthResponse>, StatusCode> {
    let mut checks = vec![];
    let mut all_ok = true;

    // Check bot store
    let store_status = match state.store.ping().await {
        Ok(_) => "ok",
        Err(_) => {
            all_ok = false;
            "error"
        }
    };
    checks.push(HealthCheck {
        name: "store".to_string(),
        status: store_status.to_string(),
    });

    let monitor_state = state.monitor.state();
    if !monitor_running(monitor_state) {
        all_ok = false;
    }
    checks.push(HealthCheck {
        name: "monitor".to_string(),
        status: serde_json::to_value(monitor_state)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string()),
    });

    checks.push(HealthCheck {
        name: "backends".to_string(),
        status: if state.registry.is_empty() {
            "none".to_string()
        } else {
            state.registry.kinds().join(",")
        },
    });

    // Get metrics snapshot
    let metrics = state.metrics.snapshot().await;

    let response = DetailedHealthResponse {
        status: if all_ok { "healthy".to_string() } else { "degraded".to_string() },
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks,
        fleet: FleetView {
            instance_id: state.monitor.instance_id().to_string(),
            distributed: state.monitor.is_distributed(),
            instance_count: state.monitor.instance_count(),
        },
        metrics: HealthMetrics {
            uptime_secs: metrics.uptime_secs,
            counters: metrics.counters,
            gauges: metrics.gauges,
            histograms: metrics.histograms,
        },
    };

    if all_ok {
        Ok(Json(response))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub checks: Vec<HealthCheck>,
}

#[derive(Serialize)]
pub struct DetailedHealthResponse {
    pub status: String,
    pub version: String,
    pub checks: Vec<HealthCheck>,
    pub fleet: FleetView,
    pub metrics: HealthMetrics,
}

#[derive(Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: String,
}

#[derive(Serialize)]
pub struct FleetView {
    pub instance_id: String,
    pub distributed: bool,
    pub instance_count: usize,
}

#[derive(Serialize)]
pub struct HealthMetrics {
    pub uptime_secs: u64,
    pub counters: std::collections::HashMap<String, u64>,
    pub gauges: std::collections::HashMap<String, f64>,
    pub histograms: std::collections::HashMap<String, HistogramSummary>,
}
