//! Counter store trait for abstracting in-memory and networked persistence.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Value written in place of a counter while a key is blocked.
pub const BLOCKED_SENTINEL: &str = "blocked";

/// What a store currently holds for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    /// A counter. Absent keys read as `Count(0)`.
    Count(u64),
    /// A block entry that has not yet expired.
    Blocked,
}

/// Errors raised by counter store implementations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The Redis client failed or the server rejected a command.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The stored value is neither a counter nor the block sentinel.
    #[error("Corrupt value for key {key}: {value:?}")]
    Corrupt { key: String, value: String },

    /// An increment hit a key that currently holds a block entry.
    #[error("Key {key} is blocked and cannot be incremented")]
    Blocked { key: String },
}

/// Result type alias for counter store operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Trait for counter store implementations.
///
/// Counters and block entries share one key space: blocking a key overwrites
/// its counter, and once the block expires the key reads as absent again.
/// Any key-value store with expiring keys and an atomic increment can back it.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read the state of `key`. Absence is `KeyState::Count(0)`, never an error.
    async fn get(&self, key: &str) -> StorageResult<KeyState>;

    /// Atomically add one to the counter at `key` and return the new value.
    ///
    /// An absent key starts at 1. Incrementing a blocked key is an error.
    async fn increment(&self, key: &str) -> StorageResult<u64>;

    /// Overwrite `key` with a block entry that expires after `duration`.
    async fn block(&self, key: &str, duration: Duration) -> StorageResult<()>;
}
