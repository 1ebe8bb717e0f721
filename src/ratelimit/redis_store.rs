//! Redis-backed counter store.
//!
//! Counts live as plain decimal strings under the identifier itself and are
//! bumped with `INCRBY`, which Redis executes atomically. A block replaces the
//! value with the sentinel string and attaches a millisecond TTL, so Redis
//! expiry is the only thing that ever deletes a key.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info};

use super::backend::{CounterStore, KeyState, StorageError, StorageResult, BLOCKED_SENTINEL};

/// A counter store backed by a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// Accepts either a full `redis://` URL or a bare `host:port` address.
    pub async fn connect(address: &str) -> StorageResult<Self> {
        let url = normalize_address(address);
        info!(url = %url, "Connecting to Redis");

        let client = redis::Client::open(url.as_str())?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }
}

fn normalize_address(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("redis://{}", address)
    }
}

fn parse_value(key: &str, value: Option<String>) -> StorageResult<KeyState> {
    match value {
        None => Ok(KeyState::Count(0)),
        Some(v) if v == BLOCKED_SENTINEL => Ok(KeyState::Blocked),
        Some(v) => v.parse::<u64>().map(KeyState::Count).map_err(|_| StorageError::Corrupt {
            key: key.to_string(),
            value: v,
        }),
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get(&self, key: &str) -> StorageResult<KeyState> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(key).await?;
        parse_value(key, value)
    }

    async fn increment(&self, key: &str) -> StorageResult<u64> {
        let mut conn = self.manager.clone();
        let count: u64 = conn.incr(key, 1u64).await?;
        Ok(count)
    }

    async fn block(&self, key: &str, duration: Duration) -> StorageResult<()> {
        // PX rejects zero, so the shortest block is one millisecond.
        let ttl_ms = duration.as_millis().clamp(1, u64::MAX as u128) as u64;
        debug!(key = %key, ttl_ms = ttl_ms, "Writing block entry");

        let mut conn = self.manager.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(BLOCKED_SENTINEL)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
