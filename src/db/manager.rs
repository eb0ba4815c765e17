//! Database manager implementation
//!
//! This module provides database connection management with:
//! - SQLite connection pool using r2d2
//! - Async wrapper for blocking database operations
//! - Schema setup for the preference table

use crate::core::config::StorageConfig;
use crate::core::error::{Result, TingError};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task;
use tracing::debug;

const POOL_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(30);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS preferences (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
";

/// Pooled SQLite handle for the preference database
#[derive(Clone)]
pub struct DatabaseManager {
    pool: Pool<SqliteConnectionManager>,
    db_path: PathBuf,
}

impl DatabaseManager {
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        Self::new(
            &config.preferences_db,
            config.connection_pool_size,
            Duration::from_millis(config.busy_timeout),
        )
    }

    /// Open (creating parent directories) and prepare the preference database
    pub fn new(db_path: &Path, pool_size: u32, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let connections = SqliteConnectionManager::file(db_path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            // WAL lets readers proceed while a filter state write is in flight
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            Ok(())
        });
        Self::open(connections, pool_size, db_path.to_path_buf())
    }

    /// Private in-memory database; every in-memory connection is its own
    /// database, hence a single-connection pool
    pub fn new_in_memory() -> Result<Self> {
        Self::open(SqliteConnectionManager::memory(), 1, PathBuf::from(":memory:"))
    }

    fn open(connections: SqliteConnectionManager, pool_size: u32, db_path: PathBuf) -> Result<Self> {
        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_timeout(POOL_CHECKOUT_TIMEOUT)
            .build(connections)?;

        let manager = Self { pool, db_path };
        manager.migrate()?;
        debug!(path = ?manager.db_path, pool_size, "Preference database ready");
        Ok(manager)
    }

    /// Get a connection from the pool
    pub fn get_connection(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Run a blocking closure against a pooled connection off the runtime
    pub async fn execute<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();

        task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(|e| {
            TingError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Preference database task failed: {}", e),
            ))
        })?
    }

    /// Create tables that do not exist yet
    pub fn migrate(&self) -> Result<()> {
        let conn = self.get_connection()?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn pool_size(&self) -> u32 {
        self.pool.max_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_db() -> (DatabaseManager, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("prefs.db");
        let manager = DatabaseManager::new(&db_path, 3, Duration::from_secs(5)).unwrap();
        (manager, temp_dir)
    }

    #[test]
    fn test_database_manager_creation() {
        let (manager, temp_dir) = create_test_db();
        assert_eq!(manager.pool_size(), 3);
        assert!(temp_dir.path().join("nested").join("prefs.db").exists());
    }

    #[test]
    fn test_from_config() {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig {
            preferences_db: temp_dir.path().join("prefs.db"),
            connection_pool_size: 2,
            busy_timeout: 1000,
        };
        let manager = DatabaseManager::from_config(&config).unwrap();
        assert_eq!(manager.pool_size(), 2);
        assert_eq!(manager.db_path(), config.preferences_db.as_path());
    }

    #[test]
    fn test_schema_created() {
        let manager = DatabaseManager::new_in_memory().unwrap();
        let conn = manager.get_connection().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM preferences", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_migrate_is_repeatable() {
        let (manager, _temp_dir) = create_test_db();
        assert!(manager.migrate().is_ok());
        assert!(manager.migrate().is_ok());
    }

    #[tokio::test]
    async fn test_execute_async() {
        let (manager, _temp_dir) = create_test_db();

        manager
            .execute(|conn| {
                conn.execute(
                    "INSERT INTO preferences (key, value, updated_at) VALUES ('a', 'b', 0)",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let value: String = manager
            .execute(|conn| {
                Ok(conn.query_row("SELECT value FROM preferences WHERE key = 'a'", [], |row| {
                    row.get(0)
                })?)
            })
            .await
            .unwrap();

        assert_eq!(value, "b");
    }
}
