//! Persisted filter selections
//!
//! One JSON blob per source under `filter_state.{source_id}`. Each value
//! carries its variant tag so strings, lists and include/exclude sets
//! round-trip exactly. Reads never fail: missing or corrupted state decodes to
//! an empty map so a bad entry cannot block browsing a source.

use super::installer::{CatalogLifecycleHook, InstalledCatalog};
use super::types::{FilterMap, SourceId};
use crate::core::error::Result;
use crate::db::PreferenceStore;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterState {
    pub source_id: SourceId,
    pub filters: FilterMap,
}

fn state_key(source_id: SourceId) -> String {
    format!("filter_state.{}", source_id)
}

pub struct FilterStateManager {
    store: Arc<dyn PreferenceStore>,
}

impl FilterStateManager {
    pub fn new(store: Arc<dyn PreferenceStore>) -> Self {
        Self { store }
    }

    pub async fn save_filter_state(&self, source_id: SourceId, filters: &FilterMap) {
        let state = FilterState {
            source_id,
            filters: filters.clone(),
        };
        let encoded = match serde_json::to_string(&state) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(source_id, "Failed to encode filter state: {}", e);
                return;
            }
        };

        if let Err(e) = self.store.set(&state_key(source_id), &encoded).await {
            warn!(source_id, "Failed to save filter state: {}", e);
        }
    }

    pub async fn load_filter_state(&self, source_id: SourceId) -> FilterMap {
        load(self.store.as_ref(), source_id).await
    }

    /// Current selections, then the new selections after every change
    pub fn observe_filter_state(&self, source_id: SourceId) -> BoxStream<'static, FilterMap> {
        // Subscribe before the first read so no change can slip in between
        let changes = self.store.subscribe();
        let store = self.store.clone();
        let key = state_key(source_id);

        stream::unfold(
            (store, changes, key, true),
            move |(store, mut changes, key, first)| async move {
                if !first && !wait_for_change(&mut changes, &key).await {
                    return None;
                }
                let filters = load(store.as_ref(), source_id).await;
                Some((filters, (store, changes, key, false)))
            },
        )
        .boxed()
    }

    pub async fn clear_filter_state(&self, source_id: SourceId) {
        if let Err(e) = self.store.delete(&state_key(source_id)).await {
            warn!(source_id, "Failed to clear filter state: {}", e);
        }
    }
}

/// Wait until `key` changes; false once the store stops publishing
async fn wait_for_change(changes: &mut broadcast::Receiver<String>, key: &str) -> bool {
    loop {
        match changes.recv().await {
            Ok(changed) if changed == key => return true,
            Ok(_) => continue,
            // Missed notifications may include ours, so reload to be safe
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "Filter state observer lagged");
                return true;
            }
            Err(RecvError::Closed) => return false,
        }
    }
}

async fn load(store: &dyn PreferenceStore, source_id: SourceId) -> FilterMap {
    let raw = match store.get(&state_key(source_id)).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return FilterMap::new(),
        Err(e) => {
            warn!(source_id, "Failed to read filter state: {}", e);
            return FilterMap::new();
        }
    };

    match serde_json::from_str::<FilterState>(&raw) {
        Ok(state) => state.filters,
        Err(e) => {
            warn!(source_id, "Discarding corrupted filter state: {}", e);
            FilterMap::new()
        }
    }
}

#[async_trait]
impl CatalogLifecycleHook for FilterStateManager {
    async fn on_uninstalled(&self, catalog: &InstalledCatalog) -> Result<()> {
        self.clear_filter_state(catalog.remote.source_id).await;
        Ok(())
    }
}
