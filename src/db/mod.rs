//! Database module
//!
//! This module provides persistence for per-source runtime state:
//! - SQLite connection pool management
//! - Key-value preference stores with change notifications

pub mod manager;
pub mod preferences;

pub use manager::DatabaseManager;
pub use preferences::{InMemoryPreferenceStore, PreferenceStore, SqlitePreferenceStore};
