//! In-process coordination store
//!
//! Same lease semantics as the Redis store, held in a map of member -> expiry.
//! Replicas that share one `MemoryCoordinator` (via `Arc`) see each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::debug;

use super::{CoordinationStore, Lease, MembershipEvent};
use crate::error::CoordinationError;

pub struct MemoryCoordinator {
    reachable: AtomicBool,
    members: Arc<Mutex<HashMap<String, Instant>>>,
    events: broadcast::Sender<MembershipEvent>,
    reap_interval: Duration,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            reachable: AtomicBool::new(true),
            members: Arc::new(Mutex::new(HashMap::new())),
            events,
            reap_interval: Duration::from_millis(50),
        }
    }

    /// A store whose `connect` always fails
    pub fn unreachable() -> Self {
        let store = Self::new();
        store.reachable.store(false, Ordering::SeqCst);
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        lock_members(&self.members)
    }
}

fn lock_members(
    members: &Mutex<HashMap<String, Instant>>,
) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
    // A panic while holding the lock leaves the map itself consistent
    members.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drop expired records and announce them
fn reap(members: &Mutex<HashMap<String, Instant>>, events: &broadcast::Sender<MembershipEvent>) {
    let now = Instant::now();
    let expired: Vec<String> = {
        let mut map = lock_members(members);
        let expired: Vec<String> = map
            .iter()
            .filter(|(_, expiry)| **expiry <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            map.remove(id);
        }
        expired
    };
    for id in expired {
        debug!(member = %id, "membership lease expired");
        let _ = events.send(MembershipEvent::Expired(id));
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinator {
    async fn connect(&self, _timeout: Duration) -> Result<(), CoordinationError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoordinationError::Unreachable("in-memory store marked unreachable".into()))
        }
    }

    async fn grant(&self, member_id: &str, ttl: Duration) -> Result<Lease, CoordinationError> {
        let existed = self
            .lock()
            .insert(member_id.to_string(), Instant::now() + ttl)
            .is_some();
        if !existed {
            let _ = self.events.send(MembershipEvent::Joined(member_id.to_string()));
        }
        Ok(Lease {
            member_id: member_id.to_string(),
            ttl,
        })
    }

    async fn keep_alive(&self, lease: &Lease) -> Result<(), CoordinationError> {
        let now = Instant::now();
        let mut map = self.lock();
        match map.get_mut(&lease.member_id) {
            Some(expiry) if *expiry > now => {
                *expiry = now + lease.ttl;
                Ok(())
            }
            _ => {
                map.remove(&lease.member_id);
                Err(CoordinationError::LeaseExpired(lease.member_id.clone()))
            }
        }
    }

    async fn revoke(&self, lease: &Lease) -> Result<(), CoordinationError> {
        let removed = self.lock().remove(&lease.member_id).is_some();
        if removed {
            let _ = self.events.send(MembershipEvent::Left(lease.member_id.clone()));
        }
        Ok(())
    }

    async fn members(&self) -> Result<Vec<String>, CoordinationError> {
        let now = Instant::now();
        let mut ids: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, expiry)| **expiry > now)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn watch(&self) -> Result<mpsc::Receiver<MembershipEvent>, CoordinationError> {
        let (tx, rx) = mpsc::channel(64);
        let mut events = self.events.subscribe();
        let members = self.members.clone();
        let sender = self.events.clone();
        let reap_interval = self.reap_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reap_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => reap(&members, &sender),
                    event = events.recv() => match event {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            if tx.send(MembershipEvent::Changed).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = tx.closed() => break,
                }
            }
        });

        Ok(rx)
    }
}
