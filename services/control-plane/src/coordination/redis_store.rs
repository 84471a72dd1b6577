//! Redis-backed coordination store
//!
//! Each member is a key `{prefix}:members:{id}` set with a millisecond TTL. Joins
//! and graceful leaves are published on `{prefix}:membership`; expiries are picked
//! up through keyspace notifications on the member keys.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info, warn};

use super::{CoordinationStore, Lease, MembershipEvent};
use crate::error::CoordinationError;

struct Connected {
    client: redis::Client,
    conn: MultiplexedConnection,
    endpoint: String,
}

pub struct RedisCoordinator {
    endpoints: Vec<String>,
    key_prefix: String,
    connected: OnceCell<Connected>,
}

impl RedisCoordinator {
    pub fn new(endpoints: Vec<String>, key_prefix: impl Into<String>) -> Self {
        Self {
            endpoints,
            key_prefix: key_prefix.into(),
            connected: OnceCell::new(),
        }
    }

    fn member_key(&self, member_id: &str) -> String {
        format!("{}:members:{}", self.key_prefix, member_id)
    }

    fn member_pattern(&self) -> String {
        format!("{}:members:*", self.key_prefix)
    }

    fn channel(&self) -> String {
        format!("{}:membership", self.key_prefix)
    }

    fn conn(&self) -> Result<MultiplexedConnection, CoordinationError> {
        self.connected
            .get()
            .map(|c| c.conn.clone())
            .ok_or_else(|| CoordinationError::Unreachable("not connected".into()))
    }

    async fn publish(&self, event: &MembershipEvent) -> Result<(), CoordinationError> {
        let payload = match event {
            MembershipEvent::Joined(id) => format!("joined:{}", id),
            MembershipEvent::Left(id) => format!("left:{}", id),
            MembershipEvent::Expired(id) => format!("expired:{}", id),
            MembershipEvent::Changed => "changed".to_string(),
        };
        let mut conn = self.conn()?;
        let _: i64 = redis::cmd("PUBLISH")
            .arg(self.channel())
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

async fn open(endpoint: &str) -> Result<Connected, CoordinationError> {
    let client = redis::Client::open(endpoint)?;
    let mut conn = client.get_multiplexed_async_connection().await?;
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    Ok(Connected {
        client,
        conn,
        endpoint: endpoint.to_string(),
    })
}

/// `joined:replica-a` -> `Joined("replica-a")`
fn parse_channel_payload(payload: &str) -> MembershipEvent {
    match payload.split_once(':') {
        Some(("joined", id)) => MembershipEvent::Joined(id.to_string()),
        Some(("left", id)) => MembershipEvent::Left(id.to_string()),
        Some(("expired", id)) => MembershipEvent::Expired(id.to_string()),
        _ => MembershipEvent::Changed,
    }
}

/// Keyspace notification: channel `__keyspace@0__:{prefix}:members:{id}`, payload is the
/// command name (`expired`, `del`, `set`, `pexpire`, ...).
fn parse_keyspace(channel: &str, payload: &str, key_prefix: &str) -> Option<MembershipEvent> {
    let (_, key) = channel.split_once("__:")?;
    let member = key.strip_prefix(&format!("{}:members:", key_prefix))?;
    match payload {
        "expired" => Some(MembershipEvent::Expired(member.to_string())),
        // renewals
        "pexpire" | "expire" => None,
        // joins and graceful leaves are also published on the channel
        "set" | "del" => None,
        _ => Some(MembershipEvent::Changed),
    }
}

#[async_trait]
impl CoordinationStore for RedisCoordinator {
    async fn connect(&self, timeout: Duration) -> Result<(), CoordinationError> {
        if self.endpoints.is_empty() {
            return Err(CoordinationError::Unreachable("no endpoints configured".into()));
        }

        let attempt = async {
            let mut last_err = None;
            for endpoint in &self.endpoints {
                match open(endpoint).await {
                    Ok(connected) => return Ok(connected),
                    Err(e) => {
                        debug!(endpoint = %endpoint, error = %e, "coordination endpoint unavailable");
                        last_err = Some(e);
                    }
                }
            }
            Err(last_err.unwrap_or_else(|| CoordinationError::Unreachable("no endpoints".into())))
        };

        let connected = match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => return Err(CoordinationError::Unreachable(e.to_string())),
            Err(_) => {
                return Err(CoordinationError::Unreachable(format!(
                    "no endpoint answered within {:?}",
                    timeout
                )))
            }
        };

        info!(endpoint = %connected.endpoint, "connected to coordination store");
        // A concurrent connect may have won; either connection is fine
        let _ = self.connected.set(connected);
        Ok(())
    }

    async fn grant(&self, member_id: &str, ttl: Duration) -> Result<Lease, CoordinationError> {
        let mut conn = self.conn()?;
        let _: () = redis::cmd("SET")
            .arg(self.member_key(member_id))
            .arg(Utc::now().to_rfc3339())
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        let lease = Lease {
            member_id: member_id.to_string(),
            ttl,
        };
        if let Err(e) = self.publish(&MembershipEvent::Joined(member_id.to_string())).await {
            warn!(member = %member_id, error = %e, "failed to announce membership");
        }
        Ok(lease)
    }

    async fn keep_alive(&self, lease: &Lease) -> Result<(), CoordinationError> {
        let mut conn = self.conn()?;
        let renewed: i64 = redis::cmd("PEXPIRE")
            .arg(self.member_key(&lease.member_id))
            .arg(lease.ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        if renewed == 1 {
            Ok(())
        } else {
            Err(CoordinationError::LeaseExpired(lease.member_id.clone()))
        }
    }

    async fn revoke(&self, lease: &Lease) -> Result<(), CoordinationError> {
        let mut conn = self.conn()?;
        let removed: i64 = redis::cmd("DEL")
            .arg(self.member_key(&lease.member_id))
            .query_async(&mut conn)
            .await?;
        if removed > 0 {
            self.publish(&MembershipEvent::Left(lease.member_id.clone()))
                .await?;
        }
        Ok(())
    }

    async fn members(&self) -> Result<Vec<String>, CoordinationError> {
        let mut conn = self.conn()?;
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(self.member_pattern())
            .query_async(&mut conn)
            .await?;
        let prefix = format!("{}:members:", self.key_prefix);
        let mut ids: Vec<String> = keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn watch(&self) -> Result<mpsc::Receiver<MembershipEvent>, CoordinationError> {
        let connected = self
            .connected
            .get()
            .ok_or_else(|| CoordinationError::Unreachable("not connected".into()))?;

        // Expiry notifications need keyspace events enabled; managed Redis may refuse
        // CONFIG, in which case expiries are only seen on the renewal-cadence refresh.
        let mut conn = connected.conn.clone();
        let config: redis::RedisResult<()> = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("Kgx")
            .query_async(&mut conn)
            .await;
        if let Err(e) = config {
            warn!(error = %e, "could not enable keyspace notifications");
        }

        let mut pubsub = connected.client.get_async_pubsub().await?;
        pubsub.subscribe(self.channel()).await?;
        pubsub
            .psubscribe(format!("__keyspace@*__:{}", self.member_pattern()))
            .await?;

        let (tx, rx) = mpsc::channel(64);
        let channel = self.channel();
        let key_prefix = self.key_prefix.clone();

        tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.into_on_message());
            loop {
                tokio::select! {
                    msg = messages.next() => {
                        let Some(msg) = msg else {
                            warn!("coordination watch stream closed");
                            break;
                        };
                        let name = msg.get_channel_name().to_string();
                        let payload: String = match msg.get_payload() {
                            Ok(p) => p,
                            Err(e) => {
                                debug!(error = %e, "undecodable watch payload");
                                continue;
                            }
                        };
                        let event = if name == channel {
                            Some(parse_channel_payload(&payload))
                        } else {
                            parse_keyspace(&name, &payload, &key_prefix)
                        };
                        if let Some(event) = event {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    _ = tx.closed() => break,
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let store = RedisCoordinator::new(vec![], "fleet");
        assert_eq!(store.member_key("replica-a"), "fleet:members:replica-a");
        assert_eq!(store.member_pattern(), "fleet:members:*");
        assert_eq!(store.channel(), "fleet:membership");
    }

    #[test]
    fn test_channel_payload_parsing() {
        assert_eq!(
            parse_channel_payload("joined:replica-a"),
            MembershipEvent::Joined("replica-a".into())
        );
        assert_eq!(
            parse_channel_payload("left:host-1:ab12"),
            MembershipEvent::Left("host-1:ab12".into())
        );
        assert_eq!(parse_channel_payload("garbage"), MembershipEvent::Changed);
    }

    #[test]
    fn test_keyspace_parsing() {
        assert_eq!(
            parse_keyspace("__keyspace@0__:fleet:members:replica-b", "expired", "fleet"),
            Some(MembershipEvent::Expired("replica-b".into()))
        );
        assert_eq!(
            parse_keyspace("__keyspace@0__:fleet:members:replica-b", "pexpire", "fleet"),
            None
        );
        assert_eq!(
            parse_keyspace("__keyspace@0__:other:members:replica-b", "expired", "fleet"),
            None
        );
    }

    #[tokio::test]
    async fn test_connect_without_endpoints_is_unreachable() {
        let store = RedisCoordinator::new(vec![], "fleet");
        assert!(matches!(
            store.connect(Duration::from_millis(100)).await,
            Err(CoordinationError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_is_unreachable() {
        let store = RedisCoordinator::new(vec!["redis://127.0.0.1:1/".into()], "fleet");
        assert!(matches!(
            store.connect(Duration::from_secs(2)).await,
            Err(CoordinationError::Unreachable(_))
        ));
        assert!(store.members().await.is_err());
    }

    #[tokio::test]
    async fn test_operations_before_connect_fail() {
        let store = RedisCoordinator::new(vec!["redis://127.0.0.1:6379/".into()], "fleet");
        let lease = Lease {
            member_id: "a".into(),
            ttl: Duration::from_secs(1),
        };
        assert!(matches!(
            store.keep_alive(&lease).await,
            Err(CoordinationError::Unreachable(_))
        ));
    }
}
