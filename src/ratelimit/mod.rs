//! Admission decisions and counter storage.

mod backend;
mod identity;
mod limiter;
mod memory;
mod redis_store;

pub use backend::{CounterStore, KeyState, StorageError, StorageResult, BLOCKED_SENTINEL};
pub use identity::{Classifier, Identity, IdentityKind};
pub use limiter::{
    AdmissionOrder, LimiterConfig, RateLimiter, DEFAULT_ADDRESS_LIMIT, DEFAULT_BLOCK_DURATION,
    DEFAULT_TOKEN_LIMIT,
};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
