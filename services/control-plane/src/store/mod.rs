//! Persistence collaborator: bot records and their latest status snapshot

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{BotInstance, DesiredState, RuntimeHandle, StatusSnapshot};

pub use memory::MemoryBotStore;
pub use postgres::PgBotStore;

#[async_trait]
pub trait BotStore: Send + Sync {
    async fn get_bot(&self, id: Uuid) -> Result<Option<BotInstance>, StoreError>;

    async fn list_bots(&self) -> Result<Vec<BotInstance>, StoreError>;

    async fn set_runtime_handle(&self, id: Uuid, handle: &RuntimeHandle) -> Result<(), StoreError>;

    async fn set_desired_state(&self, id: Uuid, state: DesiredState) -> Result<(), StoreError>;

    /// Replace the bot's snapshot wholesale.
    ///
    /// Returns `false` (and writes nothing) when the stored snapshot is newer.
    async fn put_snapshot(&self, bot_id: Uuid, snapshot: &StatusSnapshot) -> Result<bool, StoreError>;

    async fn get_snapshot(&self, bot_id: Uuid) -> Result<Option<StatusSnapshot>, StoreError>;

    /// Cheap reachability check for readiness probes
    async fn ping(&self) -> Result<(), StoreError>;
}
