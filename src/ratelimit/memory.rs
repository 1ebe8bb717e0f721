//! In-process counter store.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use super::backend::{CounterStore, KeyState, StorageError, StorageResult};

#[derive(Debug, Clone, Copy)]
enum Slot {
    Count(u64),
    /// `None` when the block period runs past the clock's range.
    Blocked { expires_at: Option<Instant> },
}

/// A counter store backed by a mutex-guarded map.
///
/// Every operation holds the lock for its whole duration, so increments on a
/// key are atomic with respect to each other. Block expiry is evaluated
/// lazily on access against the tokio clock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held, including expired blocks not yet evicted.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Drop every counter and block entry.
    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}

fn evict_expired(slots: &mut HashMap<String, Slot>, key: &str, now: Instant) {
    let expired = matches!(
        slots.get(key),
        Some(Slot::Blocked { expires_at: Some(expires_at) }) if *expires_at <= now
    );
    if expired {
        trace!(key = %key, "Block entry expired");
        slots.remove(key);
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> StorageResult<KeyState> {
        let mut slots = self.slots.lock();
        evict_expired(&mut slots, key, Instant::now());

        Ok(match slots.get(key) {
            None => KeyState::Count(0),
            Some(Slot::Count(count)) => KeyState::Count(*count),
            Some(Slot::Blocked { .. }) => KeyState::Blocked,
        })
    }

    async fn increment(&self, key: &str) -> StorageResult<u64> {
        let mut slots = self.slots.lock();
        evict_expired(&mut slots, key, Instant::now());

        match slots.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Count(1));
                Ok(1)
            }
            Entry::Occupied(mut occupied) => match occupied.get_mut() {
                Slot::Count(count) => {
                    *count = count.saturating_add(1);
                    Ok(*count)
                }
                Slot::Blocked { .. } => Err(StorageError::Blocked {
                    key: key.to_string(),
                }),
            },
        }
    }

    async fn block(&self, key: &str, duration: Duration) -> StorageResult<()> {
        let expires_at = Instant::now().checked_add(duration);
        if expires_at.is_none() {
            trace!(key = %key, "Block period exceeds clock range, blocking without expiry");
        }
        self.slots
            .lock()
            .insert(key.to_string(), Slot::Blocked { expires_at });
        Ok(())
    }
}
