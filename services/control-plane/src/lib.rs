pub mod config;
pub mod coordination;
pub mod error;
pub mod health;
pub mod models;
pub mod monitor;
pub mod observability;
pub mod proxy;
pub mod runtime;
pub mod store;
pub mod handlers {
    pub mod bots;
    pub mod fleet;
}

use std::sync::Arc;
use axum::{
    routing::{any, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::Settings;
pub use models::*;
pub use monitor::{FleetMonitor, MonitorState, TickReport};
pub use observability::{MetricsCollector, Logger};
pub use proxy::BotProxy;
pub use runtime::{Runtime, RuntimeRegistry};
pub use store::BotStore;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn BotStore>,
    pub registry: Arc<RuntimeRegistry>,
    pub monitor: Arc<FleetMonitor>,
    pub proxy: BotProxy,
    pub metrics: MetricsCollector,
}

impl AppState {
    pub fn new(
        store: Arc<dyn BotStore>,
        registry: Arc<RuntimeRegistry>,
        monitor: Arc<FleetMonitor>,
        settings: &Settings,
        metrics: MetricsCollector,
    ) -> Self {
        let proxy = BotProxy::new(
            store.clone(),
            registry.clone(),
            settings.proxy.clone(),
            metrics.clone(),
        );
        Self {
            store,
            registry,
            monitor,
            proxy,
            metrics,
        }
    }
}

/// Build the service router
pub fn app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Fleet API (CORS for dashboards)
    let api_routes = Router::new()
        .route("/fleet", get(handlers::fleet::fleet_status))
        .route("/bots/{id}/status", get(handlers::bots::get_status))
        .route("/bots/{id}/provision", post(handlers::bots::provision))
        .route("/bots/{id}/actions", post(handlers::bots::bot_action))
        .route("/bots/{id}/data-prep", post(handlers::bots::data_prep))
        .layer(cors)
        .with_state(state.clone());

    // Bot proxy (no CORS; the bot's own API decides)
    let proxy_routes = Router::new()
        .route("/bot/{id}", any(proxy::proxy_root))
        .route("/bot/{id}/", any(proxy::proxy_root))
        .route("/bot/{id}/{*path}", any(proxy::proxy_path))
        .with_state(state.clone());

    let health_routes = Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/health/detail", get(health::health_detail))
        .with_state(state);

    Router::new()
        .merge(health_routes)
        .nest("/v1", api_routes.merge(proxy_routes))
        .layer(TraceLayer::new_for_http())
}
