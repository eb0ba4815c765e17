//! Source health checks
//!
//! Probes sources on demand and caches the outcome for a fixed TTL. Expired
//! entries are never returned. A probe that does not answer within the probe
//! timeout reports `Offline` rather than `Error`.

use super::installer::{CatalogLifecycleHook, InstalledCatalog};
use super::source::Source;
use super::types::SourceId;
use crate::core::config::HealthConfig;
use crate::core::error::{Result, TingError};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum HealthStatus {
    Online,
    Offline,
    LoginRequired,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceHealth {
    pub source_id: SourceId,
    pub status: HealthStatus,
    pub last_checked_at_millis: i64,
    pub response_time_millis: Option<u64>,
}

/// Resolves source ids to live sources
#[async_trait]
pub trait SourceLookup: Send + Sync {
    async fn source(&self, id: SourceId) -> Option<Arc<dyn Source>>;
}

pub struct SourceHealthChecker {
    lookup: Arc<dyn SourceLookup>,
    ttl: Duration,
    probe_timeout: Duration,
    cache: RwLock<HashMap<SourceId, (Instant, SourceHealth)>>,
}

impl SourceHealthChecker {
    pub fn new(lookup: Arc<dyn SourceLookup>, ttl: Duration, probe_timeout: Duration) -> Self {
        Self {
            lookup,
            ttl,
            probe_timeout,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(lookup: Arc<dyn SourceLookup>, config: &HealthConfig) -> Self {
        Self::new(
            lookup,
            Duration::from_secs(config.cache_ttl),
            Duration::from_secs(config.probe_timeout),
        )
    }

    /// Cached health if present and fresh, otherwise a live probe
    pub async fn check_status(&self, id: SourceId) -> SourceHealth {
        if let Some(health) = self.cached(id) {
            debug!(source_id = id, "Health cache hit");
            return health;
        }

        let Some(source) = self.lookup.source(id).await else {
            return SourceHealth {
                source_id: id,
                status: HealthStatus::Error(format!("Source not found: {}", id)),
                last_checked_at_millis: chrono::Utc::now().timestamp_millis(),
                response_time_millis: None,
            };
        };

        let health = self.probe(id, source.as_ref()).await;
        self.write_cache().insert(id, (Instant::now(), health.clone()));
        health
    }

    /// Probe many sources concurrently; each is bounded by the probe timeout
    pub async fn check_multiple(&self, ids: &[SourceId]) -> HashMap<SourceId, SourceHealth> {
        let mut seen = HashSet::new();
        let unique: Vec<SourceId> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();

        let results = join_all(unique.iter().map(|id| self.check_status(*id))).await;
        unique.into_iter().zip(results).collect()
    }

    /// Fresh cache entry, if any
    pub fn cached(&self, id: SourceId) -> Option<SourceHealth> {
        let cache = match self.cache.read() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache
            .get(&id)
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, health)| health.clone())
    }

    pub fn clear_cache(&self, id: SourceId) {
        self.write_cache().remove(&id);
    }

    pub fn clear_all_cache(&self) {
        self.write_cache().clear();
    }

    fn write_cache(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<SourceId, (Instant, SourceHealth)>> {
        match self.cache.write() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn probe(&self, id: SourceId, source: &dyn Source) -> SourceHealth {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.probe_timeout, source.probe()).await;
        let elapsed = started.elapsed().as_millis() as u64;

        let (status, response_time_millis) = match outcome {
            Err(_) => {
                warn!(source_id = id, timeout_ms = self.probe_timeout.as_millis() as u64, "Health probe timed out");
                (HealthStatus::Offline, None)
            }
            Ok(Ok(())) => (HealthStatus::Online, Some(elapsed)),
            Ok(Err(e)) => {
                debug!(source_id = id, "Health probe failed: {}", e);
                (classify(&e), Some(elapsed))
            }
        };

        SourceHealth {
            source_id: id,
            status,
            last_checked_at_millis: chrono::Utc::now().timestamp_millis(),
            response_time_millis,
        }
    }
}

fn classify(err: &TingError) -> HealthStatus {
    match err {
        TingError::NetworkError { status: Some(401 | 403), .. } => HealthStatus::LoginRequired,
        TingError::NetworkError { timed_out: true, .. } => HealthStatus::Offline,
        // no status: the server was never reached
        TingError::NetworkError { status: None, .. } => HealthStatus::Offline,
        other => HealthStatus::Error(other.to_string()),
    }
}

#[async_trait]
impl CatalogLifecycleHook for SourceHealthChecker {
    async fn on_uninstalled(&self, catalog: &InstalledCatalog) -> Result<()> {
        self.clear_cache(catalog.remote.source_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::source::MangaListQuery;
    use crate::plugin::types::{Chapter, Command, FilterDefinition, Listing, Manga, Page, PageResult};
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behavior {
        Healthy,
        Hang,
        Status(u16),
        Unreachable,
        Broken,
    }

    struct FakeSource {
        id: SourceId,
        behavior: Behavior,
        probes: AtomicUsize,
    }

    #[async_trait]
    impl Source for FakeSource {
        fn id(&self) -> SourceId {
            self.id
        }
        fn name(&self) -> &str {
            "fake"
        }
        fn lang(&self) -> &str {
            "en"
        }
        async fn get_manga_list(&self, _query: &MangaListQuery, _page: u32) -> Result<PageResult> {
            Ok(PageResult::default())
        }
        async fn get_manga_details(&self, manga: &Manga, _commands: &[Command]) -> Result<Manga> {
            Ok(manga.clone())
        }
        async fn get_chapter_list(&self, _manga: &Manga, _commands: &[Command]) -> Result<Vec<Chapter>> {
            Ok(Vec::new())
        }
        async fn get_page_list(&self, _chapter: &Chapter, _commands: &[Command]) -> Result<Vec<Page>> {
            Ok(Vec::new())
        }
        async fn get_listings(&self) -> Result<Vec<Listing>> {
            Ok(Vec::new())
        }
        async fn get_filters(&self) -> Result<Vec<FilterDefinition>> {
            Ok(Vec::new())
        }
        async fn get_commands(&self) -> Result<Vec<Command>> {
            Ok(Vec::new())
        }
        async fn probe(&self) -> Result<()> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Healthy => Ok(()),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
                Behavior::Status(status) => Err(TingError::http_status(status, "https://fake.test")),
                Behavior::Unreachable => Err(TingError::network("connection refused")),
                Behavior::Broken => Err(TingError::ScriptError("selector missing".into())),
            }
        }
    }

    struct MapLookup(HashMap<SourceId, Arc<FakeSource>>);

    #[async_trait]
    impl SourceLookup for MapLookup {
        async fn source(&self, id: SourceId) -> Option<Arc<dyn Source>> {
            self.0.get(&id).map(|s| s.clone() as Arc<dyn Source>)
        }
    }

    fn setup(ttl: Duration) -> (SourceHealthChecker, HashMap<SourceId, Arc<FakeSource>>) {
        let sources: HashMap<_, _> = [
            (1, Behavior::Healthy),
            (2, Behavior::Hang),
            (3, Behavior::Status(403)),
            (4, Behavior::Unreachable),
            (5, Behavior::Broken),
        ]
        .into_iter()
        .map(|(id, behavior)| {
            (
                id,
                Arc::new(FakeSource {
                    id,
                    behavior,
                    probes: AtomicUsize::new(0),
                }),
            )
        })
        .collect();

        let checker = SourceHealthChecker::new(
            Arc::new(MapLookup(sources.clone())),
            ttl,
            Duration::from_millis(300),
        );
        (checker, sources)
    }

    #[tokio::test]
    async fn test_cache_within_ttl() {
        let (checker, sources) = setup(Duration::from_secs(60));

        let first = checker.check_status(1).await;
        let second = checker.check_status(1).await;
        assert_eq!(first.status, HealthStatus::Online);
        assert_eq!(first, second);
        assert_eq!(sources[&1].probes.load(Ordering::SeqCst), 1);

        checker.clear_cache(1);
        assert!(checker.cached(1).is_none());
        checker.check_status(1).await;
        assert_eq!(sources[&1].probes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expired_entries_are_not_returned() {
        let (checker, sources) = setup(Duration::from_millis(100));

        checker.check_status(1).await;
        assert!(checker.cached(1).is_some());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(checker.cached(1).is_none());

        checker.check_status(1).await;
        assert_eq!(sources[&1].probes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let (checker, _) = setup(Duration::from_secs(60));

        assert_eq!(checker.check_status(2).await.status, HealthStatus::Offline);
        assert_eq!(checker.check_status(3).await.status, HealthStatus::LoginRequired);
        assert_eq!(checker.check_status(4).await.status, HealthStatus::Offline);
        assert!(matches!(
            checker.check_status(5).await.status,
            HealthStatus::Error(m) if m.contains("selector missing")
        ));
    }

    #[tokio::test]
    async fn test_unknown_source_is_not_cached() {
        let (checker, _) = setup(Duration::from_secs(60));

        let health = checker.check_status(99).await;
        assert_eq!(health.status, HealthStatus::Error("Source not found: 99".to_string()));
        assert!(checker.cached(99).is_none());
    }

    #[tokio::test]
    async fn test_check_multiple_bounded_by_probe_timeout() {
        let (checker, _) = setup(Duration::from_secs(60));

        let started = Instant::now();
        let results = checker.check_multiple(&[1, 2, 3, 4, 5, 1]).await;
        assert!(started.elapsed() < Duration::from_millis(1000));

        assert_eq!(results.len(), 5);
        assert_eq!(results[&1].status, HealthStatus::Online);
        assert_eq!(results[&2].status, HealthStatus::Offline);
        assert_eq!(results[&3].status, HealthStatus::LoginRequired);

        checker.clear_all_cache();
        assert!(checker.cached(1).is_none());
    }
}
