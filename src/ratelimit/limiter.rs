//! Core admission decision.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::backend::{CounterStore, KeyState};
use super::identity::{Classifier, Identity};

/// Default per-token threshold.
pub const DEFAULT_TOKEN_LIMIT: u64 = 100;
/// Default per-address threshold.
pub const DEFAULT_ADDRESS_LIMIT: u64 = 10;
/// Default block period.
pub const DEFAULT_BLOCK_DURATION: Duration = Duration::from_secs(5 * 60);

/// Order in which the limiter reads and writes the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionOrder {
    /// Compare the stored count with the limit, then increment.
    ///
    /// The read and the write are separate round trips, so concurrent callers
    /// for one identifier can all see `count < limit` and all be admitted.
    CheckThenIncrement,
    /// Increment first and compare the returned value with the limit.
    ///
    /// Admission depends only on the store's atomic increment, so at most
    /// `limit` callers are admitted per counter lifetime. The call that trips
    /// the limit makes one read and two writes (increment, then block); this
    /// is the allowance made for the race-free ordering, whereas
    /// `CheckThenIncrement` never writes more than once per call.
    #[default]
    IncrementThenCheck,
}

/// Configuration for a [`RateLimiter`]. Fixed for the limiter's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterConfig {
    /// Maximum admitted requests per token before blocking
    pub token_limit: u64,
    /// Maximum admitted requests per address before blocking
    pub address_limit: u64,
    /// How long an identifier stays denied after tripping its limit
    pub block_duration: Duration,
    /// Read/write ordering
    pub order: AdmissionOrder,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            token_limit: DEFAULT_TOKEN_LIMIT,
            address_limit: DEFAULT_ADDRESS_LIMIT,
            block_duration: DEFAULT_BLOCK_DURATION,
            order: AdmissionOrder::default(),
        }
    }
}

/// Decides whether requests are admitted.
///
/// The limiter keeps no state of its own; every decision is one read and at
/// most two writes against the injected [`CounterStore`]. Any store failure
/// denies the request.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    config: LimiterConfig,
    classifier: Classifier,
}

impl RateLimiter {
    /// Create a limiter over `store`.
    pub fn new(store: Arc<dyn CounterStore>, config: LimiterConfig) -> Self {
        let classifier = Classifier::new(config.token_limit, config.address_limit);
        Self {
            store,
            config,
            classifier,
        }
    }

    /// Get the limiter configuration.
    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Get the classifier built from the configured thresholds.
    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Decide whether a request classified as `identity` is admitted.
    pub async fn check(&self, identity: &Identity) -> bool {
        self.allow(&identity.key, identity.limit).await
    }

    /// Decide whether one more request for `identifier` is admitted under `limit`.
    ///
    /// Exactly `limit` requests are admitted; the next one is denied and blocks
    /// the identifier for the configured duration. A blocked identifier is
    /// denied without touching the store again, so retries do not extend the
    /// block.
    pub async fn allow(&self, identifier: &str, limit: u64) -> bool {
        let count = match self.store.get(identifier).await {
            Ok(KeyState::Count(count)) => count,
            Ok(KeyState::Blocked) => {
                debug!(identifier = %identifier, "Identifier is blocked");
                return false;
            }
            Err(e) => {
                warn!(identifier = %identifier, error = %e, "Failed to read counter, denying");
                return false;
            }
        };

        trace!(
            identifier = %identifier,
            count = count,
            limit = limit,
            "Checking admission"
        );

        match self.config.order {
            AdmissionOrder::CheckThenIncrement => {
                self.check_then_increment(identifier, count, limit).await
            }
            AdmissionOrder::IncrementThenCheck => self.increment_then_check(identifier, limit).await,
        }
    }

    async fn check_then_increment(&self, identifier: &str, count: u64, limit: u64) -> bool {
        if count >= limit {
            self.block(identifier, count, limit).await;
            return false;
        }

        match self.store.increment(identifier).await {
            Ok(_) => true,
            Err(e) => {
                warn!(identifier = %identifier, error = %e, "Failed to increment counter, denying");
                false
            }
        }
    }

    async fn increment_then_check(&self, identifier: &str, limit: u64) -> bool {
        let count = match self.store.increment(identifier).await {
            Ok(count) => count,
            Err(e) => {
                warn!(identifier = %identifier, error = %e, "Failed to increment counter, denying");
                return false;
            }
        };

        if count > limit {
            self.block(identifier, count, limit).await;
            return false;
        }

        true
    }

    async fn block(&self, identifier: &str, count: u64, limit: u64) {
        debug!(
            identifier = %identifier,
            count = count,
            limit = limit,
            block_secs = self.config.block_duration.as_secs_f64(),
            "Rate limit reached, blocking identifier"
        );

        if let Err(e) = self.store.block(identifier, self.config.block_duration).await {
            warn!(identifier = %identifier, error = %e, "Failed to write block entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::backend::{StorageError, StorageResult};
    use crate::ratelimit::MemoryStore;
    use async_trait::async_trait;
    use tokio::sync::Barrier;

    fn io_error() -> StorageError {
        StorageError::Redis(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "connection refused",
        )))
    }

    /// Wraps a memory store and fails the selected operations.
    #[derive(Default)]
    struct FaultyStore {
        inner: MemoryStore,
        fail_reads: bool,
        fail_writes: bool,
    }

    #[async_trait]
    impl CounterStore for FaultyStore {
        async fn get(&self, key: &str) -> StorageResult<KeyState> {
            if self.fail_reads {
                return Err(io_error());
            }
            self.inner.get(key).await
        }

        async fn increment(&self, key: &str) -> StorageResult<u64> {
            if self.fail_writes {
                return Err(io_error());
            }
            self.inner.increment(key).await
        }

        async fn block(&self, key: &str, duration: Duration) -> StorageResult<()> {
            if self.fail_writes {
                return Err(io_error());
            }
            self.inner.block(key, duration).await
        }
    }

    /// Holds every reader until `parties` reads have happened, so all callers
    /// observe the same count before anyone writes.
    struct GatedStore {
        inner: MemoryStore,
        gate: Barrier,
    }

    #[async_trait]
    impl CounterStore for GatedStore {
        async fn get(&self, key: &str) -> StorageResult<KeyState> {
            let state = self.inner.get(key).await;
            self.gate.wait().await;
            state
        }

        async fn increment(&self, key: &str) -> StorageResult<u64> {
            self.inner.increment(key).await
        }

        async fn block(&self, key: &str, duration: Duration) -> StorageResult<()> {
            self.inner.block(key, duration).await
        }
    }

    fn limiter_with(store: Arc<dyn CounterStore>, order: AdmissionOrder, block: Duration) -> RateLimiter {
        RateLimiter::new(
            store,
            LimiterConfig {
                token_limit: 2,
                address_limit: 2,
                block_duration: block,
                order,
            },
        )
    }

    const BOTH_ORDERS: [AdmissionOrder; 2] = [
        AdmissionOrder::CheckThenIncrement,
        AdmissionOrder::IncrementThenCheck,
    ];

    #[tokio::test]
    async fn test_allows_limit_then_denies() {
        for order in BOTH_ORDERS {
            let store = Arc::new(MemoryStore::new());
            let limiter = limiter_with(store.clone(), order, Duration::from_secs(60));

            for i in 1..=5 {
                assert!(limiter.allow("10.0.0.1", 5).await, "{:?}: request {} should pass", order, i);
            }
            assert!(!limiter.allow("10.0.0.1", 5).await, "{:?}: 6th request should be denied", order);
            assert_eq!(store.get("10.0.0.1").await.unwrap(), KeyState::Blocked);
        }
    }

    #[tokio::test]
    async fn test_blocked_identifier_stays_denied() {
        for order in BOTH_ORDERS {
            let limiter = limiter_with(Arc::new(MemoryStore::new()), order, Duration::from_secs(60));

            assert!(limiter.allow("a", 1).await);
            assert!(!limiter.allow("a", 1).await);
            for _ in 0..10 {
                assert!(!limiter.allow("a", 1).await);
            }
        }
    }

    #[tokio::test]
    async fn test_zero_limit_denies_everything() {
        for order in BOTH_ORDERS {
            let limiter = limiter_with(Arc::new(MemoryStore::new()), order, Duration::from_secs(60));
            assert!(!limiter.allow("a", 0).await);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_expires_and_count_restarts() {
        for order in BOTH_ORDERS {
            let limiter = limiter_with(Arc::new(MemoryStore::new()), order, Duration::from_secs(1));

            assert!(limiter.allow("a", 2).await);
            assert!(limiter.allow("a", 2).await);
            assert!(!limiter.allow("a", 2).await);

            // Repeated denials during the block must not push the expiry out
            tokio::time::advance(Duration::from_millis(900)).await;
            assert!(!limiter.allow("a", 2).await);

            tokio::time::advance(Duration::from_millis(100)).await;
            assert!(limiter.allow("a", 2).await);
            assert!(limiter.allow("a", 2).await);
            assert!(!limiter.allow("a", 2).await);
        }
    }

    #[tokio::test]
    async fn test_huge_block_period_still_denies() {
        // Parses, but lies beyond what the monotonic clock can represent
        let yaml = "limits:\n  block_time: 4000000000000000h\n";
        let config = crate::config::TurnstileConfig::from_yaml(yaml).unwrap();
        assert_eq!(
            config.limits.block_time,
            Duration::from_secs(14_400_000_000_000_000_000)
        );

        for order in BOTH_ORDERS {
            let limiter = limiter_with(Arc::new(MemoryStore::new()), order, config.limits.block_time);

            assert!(limiter.allow("a", 1).await);
            assert!(!limiter.allow("a", 1).await);
            assert!(!limiter.allow("a", 1).await);
        }
    }

    #[tokio::test]
    async fn test_identifiers_are_independent() {
        let limiter = limiter_with(
            Arc::new(MemoryStore::new()),
            AdmissionOrder::default(),
            Duration::from_secs(60),
        );

        assert!(limiter.allow("token", 1).await);
        assert!(!limiter.allow("token", 1).await);
        assert!(limiter.allow("10.0.0.1", 1).await);
    }

    #[tokio::test]
    async fn test_read_failure_denies() {
        for order in BOTH_ORDERS {
            let store = Arc::new(FaultyStore {
                fail_reads: true,
                ..Default::default()
            });
            let limiter = limiter_with(store.clone(), order, Duration::from_secs(60));

            // A zero count in the backing map does not matter once reads fail
            for _ in 0..3 {
                assert!(!limiter.allow("a", 100).await);
            }
            assert!(store.inner.is_empty());
        }
    }

    #[tokio::test]
    async fn test_write_failure_denies() {
        for order in BOTH_ORDERS {
            let store = Arc::new(FaultyStore {
                fail_writes: true,
                ..Default::default()
            });
            let limiter = limiter_with(store, order, Duration::from_secs(60));
            assert!(!limiter.allow("a", 100).await);
        }
    }

    #[tokio::test]
    async fn test_check_uses_identity_limit() {
        let limiter = limiter_with(
            Arc::new(MemoryStore::new()),
            AdmissionOrder::default(),
            Duration::from_secs(60),
        );
        let identity = limiter.classifier().classify("10.0.0.1", Some("key"));

        assert!(limiter.check(&identity).await);
        assert!(limiter.check(&identity).await);
        assert!(!limiter.check(&identity).await);
    }

    async fn race(order: AdmissionOrder, callers: usize, limit: u64) -> usize {
        let store = Arc::new(GatedStore {
            inner: MemoryStore::new(),
            gate: Barrier::new(callers),
        });
        let limiter = Arc::new(limiter_with(store, order, Duration::from_secs(60)));

        let handles: Vec<_> = (0..callers)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.allow("fresh", limit).await })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        admitted
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_check_then_increment_race_can_overshoot() {
        let admitted = race(AdmissionOrder::CheckThenIncrement, 8, 3).await;

        // Every caller read a count of zero before anyone incremented
        assert!((1..=8).contains(&admitted));
        assert_eq!(admitted, 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_increment_then_check_admits_exactly_limit() {
        let admitted = race(AdmissionOrder::IncrementThenCheck, 8, 3).await;
        assert_eq!(admitted, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_without_gate() {
        let store = Arc::new(MemoryStore::new());
        let limiter = Arc::new(limiter_with(
            store,
            AdmissionOrder::CheckThenIncrement,
            Duration::from_secs(60),
        ));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.allow("fresh", 4).await })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert!((1..=16).contains(&admitted));
    }

    #[test]
    fn test_default_config() {
        let config = LimiterConfig::default();
        assert_eq!(config.token_limit, 100);
        assert_eq!(config.address_limit, 10);
        assert_eq!(config.block_duration, Duration::from_secs(300));
        assert_eq!(config.order, AdmissionOrder::IncrementThenCheck);
    }
}
