//! Redis snapshot store.

use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use tracing::{debug, info};

use super::{Result, SnapshotStore};
use crate::payload::DataMap;

/// Redis snapshot store.
///
/// Stores each snapshot as a JSON string under `{prefix}:snapshot:{key}`,
/// expiring with the configured TTL.
pub struct RedisSnapshotStore {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisSnapshotStore {
    /// Create a new Redis snapshot store.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., redis://localhost:6379)
    /// * `key_prefix` - Prefix for all keys (default: "pubsync")
    pub async fn new(url: &str, key_prefix: Option<&str>) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        info!(url = %url, "Connected to Redis for snapshots");

        Ok(Self {
            conn,
            key_prefix: key_prefix.unwrap_or("pubsync").to_string(),
        })
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}:snapshot:{}", self.key_prefix, key)
    }
}

#[async_trait]
impl SnapshotStore for RedisSnapshotStore {
    async fn get(&self, key: &str) -> Result<Option<DataMap>> {
        let redis_key = self.redis_key(key);
        let mut conn = self.conn.clone();

        let raw: Option<String> = conn.get(&redis_key).await?;

        match raw {
            Some(raw) => {
                let data: DataMap = serde_json::from_str(&raw)?;
                debug!(key = %key, "Retrieved snapshot from Redis");
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, data: &DataMap, ttl: Duration) -> Result<()> {
        let redis_key = self.redis_key(key);
        let mut conn = self.conn.clone();

        let raw = serde_json::to_string(data)?;
        let ttl_secs = ttl.as_secs().max(1);
        let _: () = conn.set_ex(&redis_key, raw, ttl_secs).await?;

        debug!(key = %key, ttl_secs, "Stored snapshot in Redis");
        Ok(())
    }
}
