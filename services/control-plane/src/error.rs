//! Error taxonomy for the fleet core

use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Errors raised by a [`crate::runtime::Runtime`] backend
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Creation rejected: invalid spec, quota exhausted, image unavailable
    #[error("provision failed: {0}")]
    Provision(String),

    /// Start/stop/restart failed
    #[error("lifecycle operation failed: {0}")]
    Lifecycle(String),

    /// The backend no longer recognizes the handle
    #[error("runtime handle not found: {0}")]
    NotFound(String),

    /// Backend unreachable or timed out
    #[error("backend unavailable: {0}")]
    Transient(String),

    #[error("backend '{0}' is not registered")]
    Unsupported(String),
}

impl RuntimeError {
    /// HTTP status used when a runtime error surfaces through the API
    pub fn status_code(&self) -> StatusCode {
        match self {
            RuntimeError::Provision(_) => StatusCode::UNPROCESSABLE_ENTITY,
            RuntimeError::Lifecycle(_) => StatusCode::CONFLICT,
            RuntimeError::NotFound(_) => StatusCode::NOT_FOUND,
            RuntimeError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            RuntimeError::Unsupported(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Errors from the shared lease/watch store
#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("coordination store unreachable: {0}")]
    Unreachable(String),

    #[error("lease for member '{0}' expired")]
    LeaseExpired(String),

    #[error("coordination store error: {0}")]
    Backend(#[from] redis::RedisError),
}

/// Errors from the persistence collaborator
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("bot {0} not found")]
    BotNotFound(uuid::Uuid),
}

/// Failures of the bot proxy, each mapped to one gateway status
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("bot not found")]
    UnknownBot { bot_id: String },

    #[error("bot endpoint not resolvable: {reason}")]
    Unresolvable {
        bot_id: String,
        reason: String,
        retry_after_secs: u64,
    },

    #[error("upstream connection failed: {reason}")]
    UpstreamConnect { bot_id: String, reason: String },

    #[error("upstream did not respond within {}s", .timeout.as_secs())]
    UpstreamTimeout { bot_id: String, timeout: Duration },

    #[error("bad request: {reason}")]
    BadRequest { bot_id: String, reason: String },
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::UnknownBot { .. } => StatusCode::NOT_FOUND,
            ProxyError::Unresolvable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::UpstreamConnect { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::BadRequest { .. } => StatusCode::BAD_REQUEST,
        }
    }

    pub fn bot_id(&self) -> &str {
        match self {
            ProxyError::UnknownBot { bot_id }
            | ProxyError::Unresolvable { bot_id, .. }
            | ProxyError::UpstreamConnect { bot_id, .. }
            | ProxyError::UpstreamTimeout { bot_id, .. }
            | ProxyError::BadRequest { bot_id, .. } => bot_id,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "error": self.to_string(),
            "bot_id": self.bot_id(),
        }));
        let mut response = (self.status_code(), body).into_response();
        if let ProxyError::Unresolvable { retry_after_secs, .. } = &self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(*retry_after_secs));
        }
        response
    }
}
