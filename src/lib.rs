//! Ting Sources Library
//!
//! Extension runtime for content sources: sandboxed script sources, rate
//! limited HTTP clients, catalog installation, health checks and persisted
//! filter state.

pub mod core;
pub mod db;
pub mod network;
pub mod plugin;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use crate::core::{Config, Result, TingError};
pub use db::DatabaseManager;
pub use network::{HttpClientFactory, RateLimiterRegistry};
pub use plugin::{CatalogInstaller, Source, SourceRegistry, UserSourceEngine};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
