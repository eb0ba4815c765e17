//! Configuration management

use clap::{Parser, Subcommand};
use config::{Config as ConfigBuilder, ConfigError as BuilderError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid http configuration: {0}")]
    InvalidHttp(String),

    #[error("Invalid rate limit configuration: {0}")]
    InvalidRateLimit(String),

    #[error("Invalid sandbox configuration: {0}")]
    InvalidSandbox(String),

    #[error("Invalid catalog configuration: {0}")]
    InvalidCatalogs(String),

    #[error("Invalid health configuration: {0}")]
    InvalidHealth(String),

    #[error("Invalid storage configuration: {0}")]
    InvalidStorage(String),

    #[error("Invalid logging configuration: {0}")]
    InvalidLogging(String),

    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
}

impl From<BuilderError> for ConfigError {
    fn from(err: BuilderError) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub http: HttpConfig,
    pub rate_limit: RateLimitConfig,
    pub sandbox: SandboxConfig,
    pub catalogs: CatalogConfig,
    pub health: HealthConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Root directory for runtime state when nothing else is configured
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("ting-sources"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
    let data_dir = default_data_dir();
    let path = |p: &str| data_dir.join(p).display().to_string();

    Ok(ConfigBuilder::builder()
        .set_default("http.connect_timeout", 10)?
        .set_default("http.read_timeout", 15)?
        .set_default("http.call_timeout", 30)?
        .set_default("http.user_agent", DEFAULT_USER_AGENT)?
        .set_default("http.cache_dir", path("http-cache"))?
        .set_default("http.cache_max_bytes", 15 * 1024 * 1024)? // 15 MB
        .set_default("rate_limit.capacity", 5)?
        .set_default("rate_limit.refill_interval_ms", 1000)?
        .set_default("rate_limit.max_wait", 30)?
        .set_default("sandbox.max_execution_time", 20)?
        .set_default("sandbox.max_memory_bytes", 256 * 1024 * 1024)? // 256 MB
        .set_default("catalogs.install_dir", path("catalogs"))?
        .set_default("catalogs.temp_dir", path("tmp"))?
        .set_default("health.cache_ttl", 300)?
        .set_default("health.probe_timeout", 10)?
        .set_default("storage.preferences_db", path("preferences.db"))?
        .set_default("storage.connection_pool_size", 4)?
        .set_default("storage.busy_timeout", 5000)?
        .set_default("logging.level", "info")?
        .set_default("logging.format", "text")?
        .set_default("logging.output", "stdout")?
        .set_default("logging.file_prefix", "ting-sources.log")?)
}

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

impl Config {
    /// Load configuration with precedence: CLI args > Environment variables > Config file > Defaults
    pub fn load(cli_args: &CliArgs) -> Result<Self, ConfigError> {
        let mut builder = defaults()?;

        if let Some(config_path) = &cli_args.config {
            if !config_path.exists() {
                return Err(ConfigError::FileNotFound(config_path.display().to_string()));
            }
            builder = builder.add_source(File::from(config_path.as_path()));
        }

        // Example: TING_HTTP__CALL_TIMEOUT=60
        builder = builder.add_source(
            Environment::with_prefix("TING")
                .separator("__")
                .try_parsing(true),
        );

        if let Some(dir) = &cli_args.install_dir {
            builder = builder.set_override("catalogs.install_dir", dir.display().to_string())?;
        }
        if let Some(db) = &cli_args.preferences_db {
            builder = builder.set_override("storage.preferences_db", db.display().to_string())?;
        }
        if let Some(endpoint) = &cli_args.flaresolverr {
            builder = builder.set_override("http.flaresolverr_url", endpoint.clone())?;
        }
        if let Some(log_level) = &cli_args.log_level {
            builder = builder.set_override("logging.level", log_level.clone())?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path, on top of the defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let config: Config = defaults()?
            .add_source(File::from(path))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Defaults only
    pub fn from_defaults() -> Result<Self, ConfigError> {
        let config: Config = defaults()?.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.http.validate()?;
        self.rate_limit.validate()?;
        self.sandbox.validate()?;
        self.catalogs.validate()?;
        self.health.validate()?;
        self.storage.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

/// Command-line arguments
#[derive(Debug, Parser)]
#[command(name = "ting-sources")]
#[command(about = "Source extension runtime for Ting Reader", long_about = None)]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Directory where catalogs are installed
    #[arg(long, value_name = "DIR", global = true)]
    pub install_dir: Option<PathBuf>,

    /// Preferences database path
    #[arg(long, value_name = "PATH", global = true)]
    pub preferences_db: Option<PathBuf>,

    /// FlareSolverr endpoint used to pass anti-bot challenges
    #[arg(long, value_name = "URL", global = true)]
    pub flaresolverr: Option<String>,

    /// Log level (debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Download and install a catalog package
    Install {
        /// Package name, unique per catalog
        #[arg(long)]
        package: String,
        /// Download URL of the package
        #[arg(long)]
        url: String,
        /// Display name of the source
        #[arg(long)]
        name: String,
        /// Language tag of the source
        #[arg(long, default_value = "en")]
        lang: String,
        /// Base URL of the site the source scrapes
        #[arg(long)]
        base_url: Option<String>,
        /// Version name of the package
        #[arg(long, default_value = "1.0.0")]
        version: String,
        /// Expected SHA-256 of the package
        #[arg(long)]
        sha256: Option<String>,
        /// Treat the package as a native archive instead of a script
        #[arg(long)]
        native: bool,
    },
    /// Remove an installed catalog package
    Uninstall {
        package: String,
    },
    /// List installed catalogs
    List,
    /// Probe source liveness
    Health {
        /// Source ids; all installed sources when omitted
        ids: Vec<i64>,
    },
    /// Browse the first listing of a source
    Browse {
        source_id: i64,
        #[arg(long, default_value_t = 1)]
        page: u32,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub connect_timeout: u64, // seconds
    pub read_timeout: u64,    // seconds
    pub call_timeout: u64,    // seconds
    pub user_agent: String,
    pub cache_dir: PathBuf,
    pub cache_max_bytes: u64,
    #[serde(default)]
    pub flaresolverr_url: Option<String>,
}

impl HttpConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout == 0 || self.read_timeout == 0 || self.call_timeout == 0 {
            return Err(ConfigError::InvalidHttp("timeouts must be greater than 0".to_string()));
        }

        if self.call_timeout < self.connect_timeout {
            return Err(ConfigError::InvalidHttp(
                "call_timeout cannot be shorter than connect_timeout".to_string(),
            ));
        }

        if self.user_agent.trim().is_empty() {
            return Err(ConfigError::InvalidHttp("user_agent cannot be empty".to_string()));
        }

        if self.cache_max_bytes == 0 {
            return Err(ConfigError::InvalidHttp("cache_max_bytes must be greater than 0".to_string()));
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub capacity: i32,
    pub refill_interval_ms: i64,
    pub max_wait: u64, // seconds
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity <= 0 {
            return Err(ConfigError::InvalidRateLimit("capacity must be greater than 0".to_string()));
        }

        if self.refill_interval_ms <= 0 {
            return Err(ConfigError::InvalidRateLimit(
                "refill_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.max_wait == 0 {
            return Err(ConfigError::InvalidRateLimit("max_wait must be greater than 0".to_string()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    pub max_execution_time: u64, // seconds
    pub max_memory_bytes: usize,
}

impl SandboxConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_execution_time == 0 {
            return Err(ConfigError::InvalidSandbox(
                "max_execution_time must be greater than 0".to_string(),
            ));
        }

        if self.max_memory_bytes < 16 * 1024 * 1024 {
            return Err(ConfigError::InvalidSandbox("max_memory_bytes must be at least 16 MB".to_string()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    pub install_dir: PathBuf,
    pub temp_dir: PathBuf,
}

impl CatalogConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.install_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidCatalogs("install_dir cannot be empty".to_string()));
        }

        if self.temp_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidCatalogs("temp_dir cannot be empty".to_string()));
        }

        if self.install_dir == self.temp_dir {
            return Err(ConfigError::InvalidCatalogs(
                "temp_dir must differ from install_dir".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    pub cache_ttl: u64,     // seconds
    pub probe_timeout: u64, // seconds
}

impl HealthConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_ttl == 0 {
            return Err(ConfigError::InvalidHealth("cache_ttl must be greater than 0".to_string()));
        }

        if self.probe_timeout == 0 {
            return Err(ConfigError::InvalidHealth("probe_timeout must be greater than 0".to_string()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub preferences_db: PathBuf,
    pub connection_pool_size: u32,
    pub busy_timeout: u64, // milliseconds
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.preferences_db.as_os_str().is_empty() {
            return Err(ConfigError::InvalidStorage("preferences_db cannot be empty".to_string()));
        }

        if self.connection_pool_size == 0 {
            return Err(ConfigError::InvalidStorage(
                "connection_pool_size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub log_dir: Option<PathBuf>,
    pub file_prefix: String,
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.as_str()) {
            return Err(ConfigError::InvalidLogging(format!(
                "level must be one of: {:?}",
                valid_levels
            )));
        }

        let valid_formats = ["json", "text"];
        if !valid_formats.contains(&self.format.as_str()) {
            return Err(ConfigError::InvalidLogging(format!(
                "format must be one of: {:?}",
                valid_formats
            )));
        }

        let valid_outputs = ["stdout", "file"];
        if !valid_outputs.contains(&self.output.as_str()) {
            return Err(ConfigError::InvalidLogging(format!(
                "output must be one of: {:?}",
                valid_outputs
            )));
        }

        if self.output == "file" && self.log_dir.is_none() {
            return Err(ConfigError::InvalidLogging(
                "log_dir must be specified when output is 'file'".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::from_defaults().unwrap();
        assert_eq!(config.health.cache_ttl, 300);
        assert_eq!(config.health.probe_timeout, 10);
        assert_eq!(config.rate_limit.capacity, 5);
        assert!(config.http.flaresolverr_url.is_none());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[rate_limit]\ncapacity = 2\nrefill_interval_ms = 250\nmax_wait = 5\n\n[http]\nflaresolverr_url = \"http://localhost:8191\""
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.rate_limit.capacity, 2);
        assert_eq!(config.rate_limit.refill_interval_ms, 250);
        assert_eq!(config.http.flaresolverr_url.as_deref(), Some("http://localhost:8191"));
        // untouched sections keep defaults
        assert_eq!(config.http.call_timeout, 30);
    }

    #[test]
    fn test_missing_file() {
        let result = Config::from_file(Path::new("/definitely/not/here.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_invalid_rate_limit() {
        let config = RateLimitConfig {
            capacity: 0,
            refill_interval_ms: 1000,
            max_wait: 30,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_logging_requires_dir() {
        let config = LoggingConfig {
            level: "info".to_string(),
            format: "json".to_string(),
            output: "file".to_string(),
            log_dir: None,
            file_prefix: "x.log".to_string(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_catalog_dirs_must_differ() {
        let config = CatalogConfig {
            install_dir: PathBuf::from("/tmp/a"),
            temp_dir: PathBuf::from("/tmp/a"),
        };
        assert!(config.validate().is_err());
    }
}
