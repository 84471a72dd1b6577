//! Bot handlers: status, provisioning, lifecycle actions, data preparation

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::{RuntimeError, StoreError},
    models::*,
    observability::{metrics, Logger},
    AppState,
};

type ApiError = (StatusCode, String);

fn parse_bot_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| (StatusCode::NOT_FOUND, "Bot not found".to_string()))
}

fn store_error(e: StoreError) -> ApiError {
    match e {
        StoreError::BotNotFound(_) => (StatusCode::NOT_FOUND, "Bot not found".to_string()),
        e => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn runtime_error(e: RuntimeError) -> ApiError {
    (e.status_code(), e.to_string())
}

async fn load_bot(state: &AppState, raw_id: &str) -> Result<BotInstance, ApiError> {
    let id = parse_bot_id(raw_id)?;
    state
        .store
        .get_bot(id)
        .await
        .map_err(store_error)?
        .ok_or((StatusCode::NOT_FOUND, "Bot not found".to_string()))
}

/// GET /bots/{id}/status - Latest health snapshot
pub async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<String>,
) -> Result<Json<BotStatusResponse>, ApiError> {
    let bot = load_bot(&state, &bot_id).await?;
    let snapshot = state.store.get_snapshot(bot.id).await.map_err(store_error)?;
    Ok(Json(BotStatusResponse::new(&bot, snapshot)))
}

/// POST /bots/{id}/provision - Create the bot on its backend
pub async fn provision(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<String>,
) -> Result<(StatusCode, Json<ProvisionResponse>), ApiError> {
    let bot = load_bot(&state, &bot_id).await?;

    if let Some(handle) = &bot.runtime_handle {
        return Err((
            StatusCode::CONFLICT,
            format!("Bot already provisioned as {}", handle),
        ));
    }

    let runtime = state.registry.require(&bot.backend).map_err(runtime_error)?;

    let handle = match runtime.create(&bot.name, &bot.spec).await {
        Ok(handle) => handle,
        Err(e) => {
            state.metrics.increment(metrics::BOT_PROVISION_FAILED, 1).await;
            warn!(bot_id = %bot.id, backend = %bot.backend, error = %e, "provision failed");
            return Err(runtime_error(e));
        }
    };

    state
        .store
        .set_runtime_handle(bot.id, &handle)
        .await
        .map_err(store_error)?;
    state.metrics.increment(metrics::BOT_PROVISION_SUCCESS, 1).await;
    Logger::bot_event(&bot.id.to_string(), "provisioned", handle.as_str());

    if bot.desired_state == DesiredState::Running {
        runtime.start(&handle).await.map_err(runtime_error)?;
        Logger::bot_event(&bot.id.to_string(), "started", handle.as_str());
    }

    Ok((
        StatusCode::CREATED,
        Json(ProvisionResponse {
            bot_id: bot.id,
            backend: bot.backend,
            runtime_handle: handle,
        }),
    ))
}

/// POST /bots/{id}/actions - Start, stop or restart
pub async fn bot_action(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<String>,
    Json(req): Json<BotActionRequest>,
) -> Result<StatusCode, ApiError> {
    let bot = load_bot(&state, &bot_id).await?;
    let handle = bot
        .runtime_handle
        .clone()
        .ok_or((StatusCode::CONFLICT, "Bot has not been provisioned".to_string()))?;
    let runtime = state.registry.require(&bot.backend).map_err(runtime_error)?;

    let (result, desired) = match req.action {
        BotAction::Start => (runtime.start(&handle).await, DesiredState::Running),
        BotAction::Stop => (runtime.stop(&handle).await, DesiredState::Stopped),
        BotAction::Restart => (runtime.restart(&handle).await, DesiredState::Running),
    };
    result.map_err(runtime_error)?;

    state
        .store
        .set_desired_state(bot.id, desired)
        .await
        .map_err(store_error)?;
    state.metrics.increment(metrics::BOT_ACTIONS, 1).await;
    info!(bot_id = %bot.id, action = ?req.action, "bot action applied");

    Ok(StatusCode::OK)
}

/// POST /bots/{id}/data-prep - Kick off a long data preparation job on the bot
pub async fn data_prep(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<String>,
    Json(req): Json<DataPrepRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let bot = load_bot(&state, &bot_id).await?;

    let job_id = state
        .monitor
        .data_prep()
        .spawn(&bot, &req.path, req.payload)
        .await
        .map_err(runtime_error)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "bot_id": bot.id,
            "job_id": job_id,
            "timeout_secs": state.monitor.data_prep().timeout().as_secs(),
        })),
    ))
}
