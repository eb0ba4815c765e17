//! Source extension runtime
//!
//! This module provides the source runtime implementation including:
//! - Script sandbox (deno_core) with a per-source worker thread
//! - Script source engine implementing the uniform `Source` trait
//! - Catalog installer with cancellable install jobs
//! - Source registry, health checks and persisted filter state

pub mod filter_state;
pub mod health;
pub mod installer;
pub mod js_bindings;
pub mod js_runtime;
pub mod js_wrapper;
pub mod marshal;
pub mod registry;
pub mod sandbox;
pub mod source;
pub mod source_engine;
pub mod types;
pub mod value;

pub use filter_state::{FilterState, FilterStateManager};
pub use health::{HealthStatus, SourceHealth, SourceHealthChecker, SourceLookup};
pub use installer::{
    CatalogInstaller, CatalogLifecycleHook, CatalogRemote, InstallJob, InstallStep, InstalledCatalog,
};
pub use js_bindings::ScriptBindings;
pub use js_runtime::{JsRuntimeWrapper, ScriptSandbox};
pub use js_wrapper::SandboxHandle;
pub use registry::SourceRegistry;
pub use sandbox::Sandbox;
pub use source::{MangaListQuery, Source};
pub use source_engine::{SourceServices, UserSourceEngine};
pub use types::{
    Chapter, Command, CommandKind, FilterDefinition, FilterMap, FilterValue, Listing, Manga,
    MangaStatus, Page, PageResult, SourceId, SourceMetadata, UserSource,
};
pub use value::ScriptValue;
