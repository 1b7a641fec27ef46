//! Redis adapter: presence keys, offline queues, advisory locks, pub/sub

use std::time::Duration;

use redis::aio::MultiplexedConnection;
use uuid::Uuid;

use crate::error::Result;

pub const BROADCAST_CHANNEL: &str = "ws:broadcast";

const PRESENCE_TTL_SECS: u64 = 30;
const OFFLINE_QUEUE_TTL_SECS: i64 = 7 * 24 * 3600;
const OFFLINE_QUEUE_MAX_LEN: isize = 1000;

#[derive(Clone)]
pub struct Cache {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl Cache {
    pub async fn connect(url: &str, password: Option<&str>, db: i64) -> anyhow::Result<Self> {
        let info = build_connection_info(url, password, db)?;
        let client = redis::Client::open(info)?;
        let mut conn = client.get_multiplexed_tokio_connection().await?;

        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        tracing::info!("Redis connected");

        Ok(Self { client, conn })
    }

    /// Dedicated connection for the pub/sub subscriber; the multiplexed
    /// connection cannot enter subscribe mode.
    pub async fn pubsub(&self) -> Result<redis::aio::PubSub> {
        Ok(self.client.get_async_pubsub().await?)
    }

    // ========================================================================
    // Presence
    // ========================================================================

    pub async fn mark_online(&self, user_id: Uuid) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(presence_key(user_id))
            .arg("1")
            .arg("EX")
            .arg(PRESENCE_TTL_SECS)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn clear_online(&self, user_id: Uuid) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(presence_key(user_id))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn is_online(&self, user_id: Uuid) -> Result<bool> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(presence_key(user_id))
            .query_async(&mut conn)
            .await?;
        Ok(value.as_deref() == Some("1"))
    }

    // ========================================================================
    // Offline queue
    // ========================================================================

    /// Appends one serialized message, refreshes the 7-day TTL and trims the
    /// queue to its most recent entries.
    pub async fn push_offline_message(&self, user_id: Uuid, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = offline_key(user_id);
        redis::pipe()
            .cmd("RPUSH")
            .arg(&key)
            .arg(payload)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(OFFLINE_QUEUE_TTL_SECS)
            .ignore()
            .cmd("LTRIM")
            .arg(&key)
            .arg(-OFFLINE_QUEUE_MAX_LEN)
            .arg(-1)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Reads the whole queue in order and deletes it.
    pub async fn drain_offline_messages(&self, user_id: Uuid) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let key = offline_key(user_id);
        let entries: Vec<String> = redis::cmd("LRANGE")
            .arg(&key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        if !entries.is_empty() {
            redis::cmd("DEL")
                .arg(&key)
                .query_async::<_, ()>(&mut conn)
                .await?;
        }

        Ok(entries)
    }

    // ========================================================================
    // Advisory locks
    // ========================================================================

    /// SETNX with TTL, retried on contention. Locks are advisory: the TTL
    /// releases a crashed holder and database constraints remain the actual
    /// safety net.
    pub async fn acquire_lock(&self, key: &str, ttl: Duration, attempts: u32) -> Result<bool> {
        let mut conn = self.conn.clone();
        for attempt in 0..attempts {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg("1")
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut conn)
                .await?;
            if acquired.is_some() {
                return Ok(true);
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        Ok(false)
    }

    pub async fn release_lock(&self, key: &str) {
        let mut conn = self.conn.clone();
        if let Err(e) = redis::cmd("DEL").arg(key).query_async::<_, ()>(&mut conn).await {
            tracing::warn!("Failed to release lock {}: {}", key, e);
        }
    }

    // ========================================================================
    // Pub/sub
    // ========================================================================

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

pub fn presence_key(user_id: Uuid) -> String {
    format!("online:{}", user_id)
}

pub fn offline_key(user_id: Uuid) -> String {
    format!("offline_msg:{}", user_id)
}

pub fn send_lock_key(conversation_id: Uuid, sender_id: Uuid) -> String {
    format!("lock:send_msg:{}:{}", conversation_id, sender_id)
}

/// Lock key for private-conversation creation; ordered so both sides of the
/// pair compute the same key.
pub fn conversation_lock_key(a: Uuid, b: Uuid) -> String {
    let (smaller, larger) = if a.to_string() <= b.to_string() {
        (a, b)
    } else {
        (b, a)
    };
    format!("lock:create_conversation:{}:{}", smaller, larger)
}

fn build_connection_info(
    url: &str,
    password: Option<&str>,
    db: i64,
) -> anyhow::Result<redis::ConnectionInfo> {
    let base = if url.contains("://") {
        url.to_string()
    } else {
        format!("redis://{}", url)
    };
    let mut info: redis::ConnectionInfo = base.as_str().parse()?;
    if let Some(password) = password {
        info.redis.password = Some(password.to_string());
    }
    if db != 0 {
        info.redis.db = db;
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_lock_key_is_order_independent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(conversation_lock_key(a, b), conversation_lock_key(b, a));
    }

    #[test]
    fn test_key_namespaces() {
        let user = Uuid::nil();
        assert_eq!(
            presence_key(user),
            "online:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            offline_key(user),
            "offline_msg:00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_bare_host_is_promoted_to_redis_url() {
        let info = build_connection_info("localhost:6379", None, 2).unwrap();
        assert_eq!(info.redis.db, 2);
    }
}
