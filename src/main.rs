//! Ting Sources - command line host for the source extension runtime
//!
//! Installs and removes catalogs, lists them, probes source health and
//! browses a source's first page.

use ting_sources::core::{self, CliArgs, Command, Config};
use ting_sources::db::{DatabaseManager, PreferenceStore, SqlitePreferenceStore};
use ting_sources::network::{HttpClientFactory, RateLimiterRegistry};
use ting_sources::plugin::{
    CatalogInstaller, CatalogRemote, FilterStateManager, MangaListQuery, SourceHealthChecker,
    SourceRegistry, SourceServices,
};
use ting_sources::plugin::types::{derive_source_id, SourceMetadata};

use anyhow::Result;
use clap::Parser;
use futures::StreamExt;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Load configuration (handles CLI args, env vars, and config file)
    let config = match Config::load(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            // Print error to stderr since logging isn't initialized yet
            eprintln!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let _logger = match core::Logger::init(&config.logging) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return Err(e.into());
        }
    };

    info!("Starting Ting Sources v{}", env!("CARGO_PKG_VERSION"));
    info!(
        install_dir = ?config.catalogs.install_dir,
        preferences_db = ?config.storage.preferences_db,
        "Runtime configuration"
    );

    let db = DatabaseManager::from_config(&config.storage)?;
    let store: Arc<dyn PreferenceStore> = Arc::new(SqlitePreferenceStore::new(db));

    let rate_limiter = Arc::new(RateLimiterRegistry::new(&config.rate_limit, Some(store.clone())));
    let services = SourceServices {
        clients: Arc::new(HttpClientFactory::from_config(&config.http)?),
        rate_limiter: rate_limiter.clone(),
        sandbox: config.sandbox.clone(),
    };
    let registry = Arc::new(SourceRegistry::new(services));
    let health = Arc::new(SourceHealthChecker::from_config(registry.clone(), &config.health));
    let filters = Arc::new(FilterStateManager::new(store));

    let installer = CatalogInstaller::new(&config.catalogs, &config.http)?;
    installer.add_hook(registry.clone());
    installer.add_hook(health.clone());
    installer.add_hook(filters);
    installer.add_hook(rate_limiter.clone());

    match args.command {
        Command::Install {
            package,
            url,
            name,
            lang,
            base_url,
            version,
            sha256,
            native,
        } => {
            let source_id = derive_source_id(&name, &lang, base_url.as_deref().unwrap_or(""));
            let target = CatalogRemote {
                source_id,
                package_name: package,
                version_name: version,
                version_code: 1,
                download_url: url,
                is_script_package: !native,
                name,
                lang,
                base_url,
                sha256,
                metadata: SourceMetadata::default(),
            };

            let mut job = installer.install(target);
            while let Some(step) = job.next().await {
                println!("{:?}", step);
            }
        }
        Command::Uninstall { package } => {
            println!("{:?}", installer.uninstall(&package).await);
        }
        Command::List => {
            for catalog in installer.installed_catalogs() {
                let remote = &catalog.remote;
                println!(
                    "{}\t{}\t{} ({})\t{}",
                    remote.source_id,
                    remote.package_name,
                    remote.name,
                    remote.lang,
                    remote.version_name
                );
            }
        }
        Command::Health { ids } => {
            registry.load_installed(&installer).await;
            let ids = if ids.is_empty() {
                registry.sources().await.iter().map(|s| s.id()).collect()
            } else {
                ids
            };

            let mut results: Vec<_> = health.check_multiple(&ids).await.into_values().collect();
            results.sort_by_key(|h| h.source_id);
            for entry in results {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        Command::Browse { source_id, page } => {
            registry.load_installed(&installer).await;
            let source = registry.require(source_id).await?;

            let result = source.get_manga_list(&MangaListQuery::default(), page).await?;
            for manga in &result.mangas {
                println!("{}\t{}", manga.key, manga.title);
            }
            if result.has_next_page {
                println!("-- more results on page {} --", page + 1);
            }
        }
    }

    if let Err(e) = rate_limiter.persist_all().await {
        warn!("Failed to persist rate buckets: {}", e);
    }

    Ok(())
}
