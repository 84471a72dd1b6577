//! In-memory bot store for tests and database-less development

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::BotStore;
use crate::error::StoreError;
use crate::models::{BotInstance, DesiredState, RuntimeHandle, StatusSnapshot};

#[derive(Default)]
pub struct MemoryBotStore {
    bots: RwLock<HashMap<Uuid, BotInstance>>,
    snapshots: RwLock<HashMap<Uuid, StatusSnapshot>>,
}

impl MemoryBotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bot records are normally created by the API layer
    pub async fn insert_bot(&self, bot: BotInstance) {
        self.bots.write().await.insert(bot.id, bot);
    }

    pub async fn remove_bot(&self, id: Uuid) {
        self.bots.write().await.remove(&id);
        self.snapshots.write().await.remove(&id);
    }
}

#[async_trait]
impl BotStore for MemoryBotStore {
    async fn get_bot(&self, id: Uuid) -> Result<Option<BotInstance>, StoreError> {
        Ok(self.bots.read().await.get(&id).cloned())
    }

    async fn list_bots(&self) -> Result<Vec<BotInstance>, StoreError> {
        let mut bots: Vec<BotInstance> = self.bots.read().await.values().cloned().collect();
        bots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(bots)
    }

    async fn set_runtime_handle(&self, id: Uuid, handle: &RuntimeHandle) -> Result<(), StoreError> {
        let mut bots = self.bots.write().await;
        let bot = bots.get_mut(&id).ok_or(StoreError::BotNotFound(id))?;
        bot.runtime_handle = Some(handle.clone());
        bot.updated_at = Utc::now();
        Ok(())
    }

    async fn set_desired_state(&self, id: Uuid, state: DesiredState) -> Result<(), StoreError> {
        let mut bots = self.bots.write().await;
        let bot = bots.get_mut(&id).ok_or(StoreError::BotNotFound(id))?;
        bot.desired_state = state;
        bot.updated_at = Utc::now();
        Ok(())
    }

    async fn put_snapshot(&self, bot_id: Uuid, snapshot: &StatusSnapshot) -> Result<bool, StoreError> {
        let mut snapshots = self.snapshots.write().await;
        if let Some(existing) = snapshots.get(&bot_id) {
            if existing.last_seen_at > snapshot.last_seen_at {
                return Ok(false);
            }
        }
        snapshots.insert(bot_id, snapshot.clone());
        Ok(true)
    }

    async fn get_snapshot(&self, bot_id: Uuid) -> Result<Option<StatusSnapshot>, StoreError> {
        Ok(self.snapshots.read().await.get(&bot_id).cloned())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
