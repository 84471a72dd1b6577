use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, Pool, Postgres};
use tracing::info;
use uuid::Uuid;

use super::BotStore;
use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::models::{BotInstance, CreateSpec, DesiredState, RuntimeHandle, StatusSnapshot};

pub type Db = Pool<Postgres>;

pub async fn init_db(config: &DatabaseConfig) -> Result<Db, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .connect(&config.url)
        .await?;

    Ok(pool)
}

#[derive(Debug, FromRow)]
struct BotRow {
    id: Uuid,
    name: String,
    backend: String,
    spec: Json<CreateSpec>,
    desired_state: DesiredState,
    runtime_handle: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<BotRow> for BotInstance {
    fn from(row: BotRow) -> Self {
        BotInstance {
            id: row.id,
            name: row.name,
            backend: row.backend,
            spec: row.spec.0,
            desired_state: row.desired_state,
            runtime_handle: row.runtime_handle.map(RuntimeHandle::new),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct StatusRow {
    healthy: bool,
    cpu_usage: Option<f64>,
    memory_usage: Option<i64>,
    ip_address: Option<String>,
    host_port: Option<i32>,
    backend_handle: Option<String>,
    error_message: Option<String>,
    last_seen_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
}

impl From<StatusRow> for StatusSnapshot {
    fn from(row: StatusRow) -> Self {
        StatusSnapshot {
            healthy: row.healthy,
            cpu_usage: row.cpu_usage,
            memory_usage: row.memory_usage.map(|m| m.max(0) as u64),
            ip_address: row.ip_address,
            host_port: row.host_port.and_then(|p| u16::try_from(p).ok()),
            backend_handle: row.backend_handle,
            error_message: row.error_message,
            last_seen_at: row.last_seen_at,
            started_at: row.started_at,
            stopped_at: row.stopped_at,
        }
    }
}

const BOT_COLUMNS: &str =
    "id, name, backend, spec, desired_state, runtime_handle, created_at, updated_at";

/// Postgres-backed store over the `bots` and `bot_status` tables
#[derive(Clone)]
pub struct PgBotStore {
    db: Db,
}

impl PgBotStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Connect and apply the embedded migrations
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let db = init_db(config).await?;
        sqlx::migrate!("./migrations").run(&db).await?;
        info!("database migrations applied");
        Ok(Self::new(db))
    }
}

#[async_trait]
impl BotStore for PgBotStore {
    async fn get_bot(&self, id: Uuid) -> Result<Option<BotInstance>, StoreError> {
        let row = sqlx::query_as::<_, BotRow>(&format!("SELECT {} FROM bots WHERE id = $1", BOT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        Ok(row.map(BotInstance::from))
    }

    async fn list_bots(&self) -> Result<Vec<BotInstance>, StoreError> {
        let rows = sqlx::query_as::<_, BotRow>(&format!(
            "SELECT {} FROM bots ORDER BY created_at, id",
            BOT_COLUMNS
        ))
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(BotInstance::from).collect())
    }

    async fn set_runtime_handle(&self, id: Uuid, handle: &RuntimeHandle) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE bots SET runtime_handle = $1, updated_at = NOW() WHERE id = $2")
            .bind(handle.as_str())
            .bind(id)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::BotNotFound(id));
        }
        Ok(())
    }

    async fn set_desired_state(&self, id: Uuid, state: DesiredState) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE bots SET desired_state = $1, updated_at = NOW() WHERE id = $2")
            .bind(state)
            .bind(id)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::BotNotFound(id));
        }
        Ok(())
    }

    async fn put_snapshot(&self, bot_id: Uuid, snapshot: &StatusSnapshot) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO bot_status (
                bot_id, healthy, cpu_usage, memory_usage, ip_address, host_port,
                backend_handle, error_message, last_seen_at, started_at, stopped_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (bot_id) DO UPDATE SET
                healthy = EXCLUDED.healthy,
                cpu_usage = EXCLUDED.cpu_usage,
                memory_usage = EXCLUDED.memory_usage,
                ip_address = EXCLUDED.ip_address,
                host_port = EXCLUDED.host_port,
                backend_handle = EXCLUDED.backend_handle,
                error_message = EXCLUDED.error_message,
                last_seen_at = EXCLUDED.last_seen_at,
                started_at = EXCLUDED.started_at,
                stopped_at = EXCLUDED.stopped_at
            WHERE bot_status.last_seen_at <= EXCLUDED.last_seen_at
            "#,
        )
        .bind(bot_id)
        .bind(snapshot.healthy)
        .bind(snapshot.cpu_usage)
        .bind(snapshot.memory_usage.map(|m| m.min(i64::MAX as u64) as i64))
        .bind(&snapshot.ip_address)
        .bind(snapshot.host_port.map(i32::from))
        .bind(&snapshot.backend_handle)
        .bind(&snapshot.error_message)
        .bind(snapshot.last_seen_at)
        .bind(snapshot.started_at)
        .bind(snapshot.stopped_at)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_snapshot(&self, bot_id: Uuid) -> Result<Option<StatusSnapshot>, StoreError> {
        let row = sqlx::query_as::<_, StatusRow>(
            r#"
            SELECT healthy, cpu_usage, memory_usage, ip_address, host_port, backend_handle,
                   error_message, last_seen_at, started_at, stopped_at
            FROM bot_status WHERE bot_id = $1
            "#,
        )
        .bind(bot_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(StatusSnapshot::from))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").fetch_one(&self.db).await?;
        Ok(())
    }
}
