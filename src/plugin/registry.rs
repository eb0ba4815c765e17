//! Source registry
//!
//! Keeps the live sources by id. Script catalogs are turned into
//! [`UserSourceEngine`]s when installed (and at startup); native sources are
//! registered by the host. The registry is the source lookup for the health
//! checker.

use super::health::SourceLookup;
use super::installer::{CatalogInstaller, CatalogLifecycleHook, InstalledCatalog};
use super::source::Source;
use super::source_engine::{SourceServices, UserSourceEngine};
use super::types::SourceId;
use crate::core::error::{Result, TingError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub struct SourceRegistry {
    services: SourceServices,
    sources: RwLock<HashMap<SourceId, Arc<dyn Source>>>,
}

impl SourceRegistry {
    pub fn new(services: SourceServices) -> Self {
        Self {
            services,
            sources: RwLock::new(HashMap::new()),
        }
    }

    /// Build and register the engine for an installed script catalog
    ///
    /// Native catalogs are left to the host, which registers their sources
    /// with [`register`](Self::register).
    pub async fn load_catalog(&self, catalog: &InstalledCatalog) -> Result<Option<SourceId>> {
        if !catalog.remote.is_script_package {
            debug!(package = %catalog.remote.package_name, "Native catalog awaits host registration");
            return Ok(None);
        }

        let source = catalog.user_source()?;
        let engine = UserSourceEngine::load(source, &self.services).await?;
        let id = engine.source().id;
        self.register(Arc::new(engine)).await;
        Ok(Some(id))
    }

    /// Load every installed script catalog; failures are logged and skipped
    pub async fn load_installed(&self, installer: &CatalogInstaller) -> usize {
        let mut loaded = 0;
        for catalog in installer.installed_catalogs() {
            match self.load_catalog(&catalog).await {
                Ok(Some(_)) => loaded += 1,
                Ok(None) => {}
                Err(e) => warn!(
                    package = %catalog.remote.package_name,
                    error_type = e.error_type(),
                    "Failed to load catalog: {}",
                    e
                ),
            }
        }
        info!("Loaded {} script sources", loaded);
        loaded
    }

    /// Register a source, replacing any source with the same id
    pub async fn register(&self, source: Arc<dyn Source>) {
        let id = source.id();
        if self.sources.write().await.insert(id, source).is_some() {
            debug!(source_id = id, "Replaced registered source");
        }
    }

    pub async fn unregister(&self, id: SourceId) -> bool {
        self.sources.write().await.remove(&id).is_some()
    }

    pub async fn get(&self, id: SourceId) -> Option<Arc<dyn Source>> {
        self.sources.read().await.get(&id).cloned()
    }

    /// Like [`get`](Self::get), failing with `NotFound` for unknown ids
    pub async fn require(&self, id: SourceId) -> Result<Arc<dyn Source>> {
        self.get(id)
            .await
            .ok_or_else(|| TingError::NotFound(format!("Source not found: {}", id)))
    }

    pub async fn sources(&self) -> Vec<Arc<dyn Source>> {
        let mut sources: Vec<_> = self.sources.read().await.values().cloned().collect();
        sources.sort_by(|a, b| a.name().cmp(b.name()));
        sources
    }
}

#[async_trait]
impl SourceLookup for SourceRegistry {
    async fn source(&self, id: SourceId) -> Option<Arc<dyn Source>> {
        self.get(id).await
    }
}

#[async_trait]
impl CatalogLifecycleHook for SourceRegistry {
    async fn on_installed(&self, catalog: &InstalledCatalog) -> Result<()> {
        self.load_catalog(catalog).await.map(|_| ())
    }

    async fn on_uninstalled(&self, catalog: &InstalledCatalog) -> Result<()> {
        if self.unregister(catalog.remote.source_id).await {
            info!(source_id = catalog.remote.source_id, "Source unregistered");
        }
        Ok(())
    }
}
