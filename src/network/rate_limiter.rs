//! Per-source request throttling
//!
//! The registry owns one [`RateBucket`] per `(source id, endpoint class)` key.
//! Buckets are created on first use, seeded from the preference store when a
//! snapshot from an earlier run exists, and written back by [`persist_all`].
//!
//! [`persist_all`]: RateLimiterRegistry::persist_all

use crate::core::config::RateLimitConfig;
use crate::core::error::{Result, TingError};
use crate::db::PreferenceStore;
use crate::network::rate_bucket::{now_millis, RateBucket};
use crate::plugin::installer::{CatalogLifecycleHook, InstalledCatalog};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Kind of request a source makes; each kind is throttled independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Browse,
    Details,
    Chapters,
    Pages,
}

impl EndpointClass {
    pub const ALL: [EndpointClass; 4] = [
        EndpointClass::Browse,
        EndpointClass::Details,
        EndpointClass::Chapters,
        EndpointClass::Pages,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointClass::Browse => "browse",
            EndpointClass::Details => "details",
            EndpointClass::Chapters => "chapters",
            EndpointClass::Pages => "pages",
        }
    }
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn bucket_key(source_id: i64, class: EndpointClass) -> String {
    format!("rate_bucket.{}.{}", source_id, class)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Limit {
    capacity: i32,
    refill_ms: i64,
}

type SharedBucket = Arc<Mutex<RateBucket>>;

/// Registry of token buckets, passed by handle to every source engine
pub struct RateLimiterRegistry {
    buckets: Mutex<HashMap<(i64, EndpointClass), SharedBucket>>,
    limits: Mutex<HashMap<i64, Limit>>,
    default_limit: Limit,
    max_wait: Duration,
    store: Option<Arc<dyn PreferenceStore>>,
}

impl RateLimiterRegistry {
    pub fn new(config: &RateLimitConfig, store: Option<Arc<dyn PreferenceStore>>) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            limits: Mutex::new(HashMap::new()),
            default_limit: Limit {
                capacity: config.capacity,
                refill_ms: config.refill_interval_ms,
            },
            max_wait: Duration::from_secs(config.max_wait),
            store,
        }
    }

    /// Override the limit a source declared in its metadata
    ///
    /// Existing buckets of the source are dropped so the next request starts
    /// from a full bucket with the new shape.
    pub async fn set_source_limit(&self, source_id: i64, capacity: i32, refill_ms: i64) {
        let limit = Limit {
            capacity: capacity.max(1),
            refill_ms: refill_ms.max(1),
        };
        let previous = self.limits.lock().await.insert(source_id, limit);
        if previous != Some(limit) {
            self.buckets
                .lock()
                .await
                .retain(|(id, _), _| *id != source_id);
        }
    }

    async fn limit_for(&self, source_id: i64) -> Limit {
        self.limits
            .lock()
            .await
            .get(&source_id)
            .copied()
            .unwrap_or(self.default_limit)
    }

    /// Bucket for the key, created or restored on first use
    pub async fn bucket(&self, source_id: i64, class: EndpointClass) -> SharedBucket {
        if let Some(bucket) = self.buckets.lock().await.get(&(source_id, class)) {
            return bucket.clone();
        }

        let limit = self.limit_for(source_id).await;
        let restored = match &self.store {
            Some(store) => match store.get(&bucket_key(source_id, class)).await {
                Ok(Some(value)) => RateBucket::deserialize(&value).filter(|b| {
                    b.capacity() == limit.capacity && b.refill_rate_millis() == limit.refill_ms
                }),
                Ok(None) => None,
                Err(e) => {
                    warn!(source_id, class = %class, error = %e, "Failed to read persisted rate bucket");
                    None
                }
            },
            None => None,
        };
        let bucket = restored.unwrap_or_else(|| RateBucket::new(limit.capacity, limit.refill_ms));

        // A concurrent caller may have created it while the store was read
        self.buckets
            .lock()
            .await
            .entry((source_id, class))
            .or_insert_with(|| Arc::new(Mutex::new(bucket)))
            .clone()
    }

    /// Take one token without waiting
    pub async fn try_acquire(&self, source_id: i64, class: EndpointClass) -> bool {
        let bucket = self.bucket(source_id, class).await;
        let acquired = bucket.lock().await.try_consume();
        acquired
    }

    /// Take one token, waiting with exponential backoff until one is
    /// available or the configured wait budget is spent
    pub async fn acquire(&self, source_id: i64, class: EndpointClass) -> Result<()> {
        let bucket = self.bucket(source_id, class).await;
        let started = Instant::now();
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let wait = {
                let mut guard = bucket.lock().await;
                let now = now_millis();
                if guard.try_consume_at(now) {
                    return Ok(());
                }
                Duration::from_millis(guard.millis_until_next_token(now).max(0) as u64)
            };

            let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
            let sleep = wait.max(backoff) + Duration::from_millis(jitter);

            if started.elapsed() + sleep > self.max_wait {
                warn!(source_id, class = %class, "Rate limit wait budget exhausted");
                return Err(TingError::network_timeout(format!(
                    "Rate limit wait exceeded for source {} ({})",
                    source_id, class
                )));
            }

            debug!(source_id, class = %class, sleep_ms = sleep.as_millis() as u64, "Waiting for rate limit token");
            tokio::time::sleep(sleep).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Write every live bucket to the preference store
    ///
    /// The map stays locked until every write landed, so a concurrent
    /// `evict` cannot have its deletes overwritten by a stale snapshot.
    pub async fn persist_all(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let buckets = self.buckets.lock().await;
        for ((source_id, class), bucket) in buckets.iter() {
            let value = bucket.lock().await.serialize();
            store.set(&bucket_key(*source_id, *class), &value).await?;
        }
        Ok(())
    }

    /// Forget every bucket of a source, in memory and persisted
    pub async fn evict(&self, source_id: i64) -> Result<()> {
        let mut buckets = self.buckets.lock().await;
        buckets.retain(|(id, _), _| *id != source_id);
        self.limits.lock().await.remove(&source_id);

        if let Some(store) = &self.store {
            for class in EndpointClass::ALL {
                store.delete(&bucket_key(source_id, class)).await?;
            }
        }
        drop(buckets);
        debug!(source_id, "Evicted rate buckets");
        Ok(())
    }

    /// Number of live buckets
    pub async fn len(&self) -> usize {
        self.buckets.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.buckets.lock().await.is_empty()
    }
}

#[async_trait]
impl CatalogLifecycleHook for RateLimiterRegistry {
    async fn on_uninstalled(&self, catalog: &InstalledCatalog) -> Result<()> {
        self.evict(catalog.remote.source_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryPreferenceStore;

    fn config(capacity: i32, refill_ms: i64, max_wait: u64) -> RateLimitConfig {
        RateLimitConfig {
            capacity,
            refill_interval_ms: refill_ms,
            max_wait,
        }
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let registry = RateLimiterRegistry::new(&config(1, 60_000, 1), None);

        assert!(registry.try_acquire(1, EndpointClass::Browse).await);
        assert!(!registry.try_acquire(1, EndpointClass::Browse).await);
        assert!(registry.try_acquire(1, EndpointClass::Pages).await);
        assert!(registry.try_acquire(2, EndpointClass::Browse).await);
        assert_eq!(registry.len().await, 3);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_refill() {
        let registry = RateLimiterRegistry::new(&config(1, 100, 5), None);

        registry.acquire(9, EndpointClass::Details).await.unwrap();
        let started = Instant::now();
        registry.acquire(9, EndpointClass::Details).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_acquire_gives_up_after_budget() {
        let registry = RateLimiterRegistry::new(&config(1, 3_600_000, 1), None);

        registry.acquire(3, EndpointClass::Browse).await.unwrap();
        let err = registry.acquire(3, EndpointClass::Browse).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_is_atomic() {
        let registry = Arc::new(RateLimiterRegistry::new(&config(10, 3_600_000, 1), None));

        let mut handles = Vec::new();
        for _ in 0..25 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.try_acquire(4, EndpointClass::Pages).await
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 10);
    }

    #[tokio::test]
    async fn test_persist_and_restore() {
        let store: Arc<dyn PreferenceStore> = Arc::new(InMemoryPreferenceStore::new());

        let registry = RateLimiterRegistry::new(&config(3, 3_600_000, 1), Some(store.clone()));
        assert!(registry.try_acquire(5, EndpointClass::Browse).await);
        assert!(registry.try_acquire(5, EndpointClass::Browse).await);
        registry.persist_all().await.unwrap();

        let persisted = store.get("rate_bucket.5.browse").await.unwrap().unwrap();
        assert!(persisted.starts_with("3;3600000;1;"));

        let restored = RateLimiterRegistry::new(&config(3, 3_600_000, 1), Some(store.clone()));
        assert!(restored.try_acquire(5, EndpointClass::Browse).await);
        assert!(!restored.try_acquire(5, EndpointClass::Browse).await);
    }

    #[tokio::test]
    async fn test_evict_removes_persisted_state() {
        let store: Arc<dyn PreferenceStore> = Arc::new(InMemoryPreferenceStore::new());
        let registry = RateLimiterRegistry::new(&config(2, 1000, 1), Some(store.clone()));

        registry.try_acquire(8, EndpointClass::Chapters).await;
        registry.try_acquire(11, EndpointClass::Chapters).await;
        registry.persist_all().await.unwrap();

        registry.evict(8).await.unwrap();
        assert_eq!(registry.len().await, 1);
        assert!(store.get("rate_bucket.8.chapters").await.unwrap().is_none());
        assert!(store.get("rate_bucket.11.chapters").await.unwrap().is_some());
    }

    /// Store whose writes take a while, widening any persist/evict overlap
    struct SlowStore {
        inner: InMemoryPreferenceStore,
    }

    #[async_trait]
    impl PreferenceStore for SlowStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<bool> {
            self.inner.delete(key).await
        }

        fn subscribe(&self) -> tokio::sync::broadcast::Receiver<String> {
            self.inner.subscribe()
        }
    }

    #[tokio::test]
    async fn test_evict_during_persist_stays_evicted() {
        let store = Arc::new(SlowStore {
            inner: InMemoryPreferenceStore::new(),
        });
        let registry = Arc::new(RateLimiterRegistry::new(
            &config(2, 1000, 1),
            Some(store.clone() as Arc<dyn PreferenceStore>),
        ));
        registry.try_acquire(12, EndpointClass::Browse).await;

        let persisting = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.persist_all().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.evict(12).await.unwrap();
        persisting.await.unwrap().unwrap();

        assert!(registry.is_empty().await);
        assert!(store.get("rate_bucket.12.browse").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_source_limit_reshapes_bucket() {
        let registry = RateLimiterRegistry::new(&config(1, 3_600_000, 1), None);
        assert!(registry.try_acquire(6, EndpointClass::Browse).await);
        assert!(!registry.try_acquire(6, EndpointClass::Browse).await);

        registry.set_source_limit(6, 3, 3_600_000).await;
        let bucket = registry.bucket(6, EndpointClass::Browse).await;
        assert_eq!(bucket.lock().await.capacity(), 3);
        assert!(registry.try_acquire(6, EndpointClass::Browse).await);
    }
}
