use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use fleet_control::coordination::{CoordinationStore, RedisCoordinator};
use fleet_control::observability::init_tracing;
use fleet_control::runtime::{register_builtin_backends, RuntimeRegistry};
use fleet_control::store::{BotStore, MemoryBotStore, PgBotStore};
use fleet_control::{app, AppState, FleetMonitor, MetricsCollector, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    init_tracing(&settings.logging);

    info!("Starting fleet control plane...");

    // Bot store
    let store: Arc<dyn BotStore> = if settings.database.url.is_empty() {
        warn!("DATABASE_URL not set; using in-memory bot store");
        Arc::new(MemoryBotStore::new())
    } else {
        info!("Connecting to database...");
        let store = PgBotStore::connect(&settings.database).await?;
        info!("✓ Database connected, migrations applied");
        Arc::new(store)
    };

    // Runtime backends
    let mut builder = RuntimeRegistry::builder();
    register_builtin_backends(&mut builder);
    let registry = Arc::new(builder.build(&settings.effective_backends()));
    if registry.is_empty() {
        warn!("No runtime backends available; bots cannot be provisioned or checked");
    } else {
        info!(backends = ?registry.kinds(), "✓ Runtime backends ready");
    }

    // Fleet monitor
    let metrics = MetricsCollector::new();
    let mut monitor = FleetMonitor::new(
        settings.instance_id(),
        settings.monitor.clone(),
        settings.coordination.clone(),
        store.clone(),
        registry.clone(),
        metrics.clone(),
    );
    if !settings.coordination.endpoints.is_empty() {
        let coordinator: Arc<dyn CoordinationStore> = Arc::new(RedisCoordinator::new(
            settings.coordination.endpoints.clone(),
            settings.coordination.key_prefix.clone(),
        ));
        monitor = monitor.with_coordinator(coordinator);
    }
    let monitor = Arc::new(monitor);
    let mode = monitor.start().await;
    info!(instance_id = %monitor.instance_id(), mode = ?mode, "✓ Fleet monitor started");

    let state = Arc::new(AppState::new(
        store,
        registry,
        monitor.clone(),
        &settings,
        metrics,
    ));
    let router = app(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", settings.server.port)).await?;
    info!("🚀 Fleet control plane listening on port {}", settings.server.port);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    let grace = Duration::from_secs(settings.server.shutdown_grace_secs);
    monitor.stop(grace).await;
    info!("Fleet control plane stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
