//! Shared lease/watch store used by monitor replicas to find each other
//!
//! A replica holds one TTL lease under its member id for as long as it is alive.
//! Siblings learn about joins, graceful leaves and expiries through [`CoordinationStore::watch`].

pub mod memory;
pub mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::CoordinationError;

pub use memory::MemoryCoordinator;
pub use redis_store::RedisCoordinator;

/// A granted membership lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub member_id: String,
    pub ttl: Duration,
}

impl Lease {
    /// How often the holder should renew
    pub fn renew_interval(&self) -> Duration {
        (self.ttl / 3).max(Duration::from_millis(10))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined(String),
    Left(String),
    Expired(String),
    /// Something changed but the store cannot say what (e.g. a keyspace notification
    /// for a key it could not parse). Receivers re-read the member list.
    Changed,
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Establish the connection, bounded by `timeout`
    async fn connect(&self, timeout: Duration) -> Result<(), CoordinationError>;

    /// Register `member_id` with a lease that lapses after `ttl` without renewal
    async fn grant(&self, member_id: &str, ttl: Duration) -> Result<Lease, CoordinationError>;

    /// Renew. `LeaseExpired` if the record is already gone.
    async fn keep_alive(&self, lease: &Lease) -> Result<(), CoordinationError>;

    /// Remove the record immediately
    async fn revoke(&self, lease: &Lease) -> Result<(), CoordinationError>;

    /// Live member ids, sorted ascending
    async fn members(&self) -> Result<Vec<String>, CoordinationError>;

    /// Stream of membership changes. The stream ends when the receiver is dropped
    /// or the store connection is lost.
    async fn watch(&self) -> Result<mpsc::Receiver<MembershipEvent>, CoordinationError>;
}
