//! Key-value preference storage
//!
//! Filter selections and rate bucket snapshots are persisted as plain strings
//! under namespaced keys. Every store broadcasts the key of each change so that
//! observers can re-read the value they care about.

use crate::core::error::Result;
use crate::db::manager::DatabaseManager;
use async_trait::async_trait;
use rusqlite::OptionalExtension;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// String key-value store with change notifications
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Returns whether a value was removed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Receiver of changed keys, emitted after the change is visible to `get`
    fn subscribe(&self) -> broadcast::Receiver<String>;
}

/// Process-local store for tests and ephemeral hosts
pub struct InMemoryPreferenceStore {
    values: RwLock<HashMap<String, String>>,
    changes: broadcast::Sender<String>,
}

impl InMemoryPreferenceStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            values: RwLock::new(HashMap::new()),
            changes,
        }
    }
}

impl Default for InMemoryPreferenceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PreferenceStore for InMemoryPreferenceStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        // No receivers is not an error
        let _ = self.changes.send(key.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed = self.values.write().await.remove(key).is_some();
        if removed {
            let _ = self.changes.send(key.to_string());
        }
        Ok(removed)
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }
}

/// SQLite-backed store, one row per key
pub struct SqlitePreferenceStore {
    db: DatabaseManager,
    changes: broadcast::Sender<String>,
}

impl SqlitePreferenceStore {
    pub fn new(db: DatabaseManager) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { db, changes }
    }
}

#[async_trait]
impl PreferenceStore for SqlitePreferenceStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.db
            .execute(move |conn| {
                let value = conn
                    .query_row("SELECT value FROM preferences WHERE key = ?1", [&key], |row| {
                        row.get(0)
                    })
                    .optional()?;
                Ok(value)
            })
            .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let owned_key = key.to_string();
        let value = value.to_string();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO preferences (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                    rusqlite::params![owned_key, value, chrono::Utc::now().timestamp_millis()],
                )?;
                Ok(())
            })
            .await?;

        debug!(key = %key, "Preference updated");
        let _ = self.changes.send(key.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let owned_key = key.to_string();
        let removed = self
            .db
            .execute(move |conn| {
                Ok(conn.execute("DELETE FROM preferences WHERE key = ?1", [&owned_key])? > 0)
            })
            .await?;

        if removed {
            debug!(key = %key, "Preference deleted");
            let _ = self.changes.send(key.to_string());
        }
        Ok(removed)
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn exercise(store: &dyn PreferenceStore) {
        let mut changes = store.subscribe();

        assert_eq!(store.get("missing").await.unwrap(), None);

        store.set("filter_state.1", "{}").await.unwrap();
        assert_eq!(store.get("filter_state.1").await.unwrap().as_deref(), Some("{}"));
        assert_eq!(changes.recv().await.unwrap(), "filter_state.1");

        store.set("filter_state.1", "{\"a\":1}").await.unwrap();
        assert_eq!(
            store.get("filter_state.1").await.unwrap().as_deref(),
            Some("{\"a\":1}")
        );
        assert_eq!(changes.recv().await.unwrap(), "filter_state.1");

        assert!(store.delete("filter_state.1").await.unwrap());
        assert!(!store.delete("filter_state.1").await.unwrap());
        assert_eq!(store.get("filter_state.1").await.unwrap(), None);
        assert_eq!(changes.recv().await.unwrap(), "filter_state.1");
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryPreferenceStore::new();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_sqlite_store() {
        let store = SqlitePreferenceStore::new(DatabaseManager::new_in_memory().unwrap());
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_sqlite_store_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("prefs.db");

        {
            let db = DatabaseManager::new(&path, 2, Duration::from_secs(1)).unwrap();
            let store = SqlitePreferenceStore::new(db);
            store.set("rate_bucket.7.browse", "5;1000;3;0").await.unwrap();
        }

        let db = DatabaseManager::new(&path, 2, Duration::from_secs(1)).unwrap();
        let store = SqlitePreferenceStore::new(db);
        assert_eq!(
            store.get("rate_bucket.7.browse").await.unwrap().as_deref(),
            Some("5;1000;3;0")
        );
    }
}
