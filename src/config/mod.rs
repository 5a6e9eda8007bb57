//! Configuration management for the fit orchestrator
//!
//! This module handles loading and validating configuration from environment variables,
//! TOML files, and command-line overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use crate::brokers::TnsConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Catalog backend configuration
    pub catalog: CatalogConfig,

    /// Batch and worker-pool configuration
    pub orchestrator: OrchestratorConfig,

    /// External fitter configuration
    pub fit: FitConfig,

    /// Transient Name Server client configuration
    pub tns: TnsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Which catalog implementation to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogBackend {
    Sqlite,
    Postgres,
}

impl std::str::FromStr for CatalogBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => anyhow::bail!("unknown catalog backend '{other}'"),
        }
    }
}

/// Catalog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Backend to use
    pub backend: CatalogBackend,

    /// SQLite database path
    pub sqlite_path: PathBuf,

    /// PostgreSQL connection string
    pub postgres_url: String,

    /// Maximum pool size (PostgreSQL)
    pub pool_size: usize,

    /// How long a writer waits for the SQLite write lock, in milliseconds
    pub busy_timeout_ms: u64,
}

/// Batch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Worker pool size
    pub workers: usize,

    /// Cores handed to each fit; defaults to the host cores split evenly
    /// across the workers
    pub cores_per_fit: Option<usize>,

    /// Per-target fit deadline in seconds
    pub fit_timeout_secs: u64,

    /// Lease lifetime in seconds; renewed every third of this while a batch runs
    pub lease_ttl_secs: u64,

    /// `need` mode window in hours
    pub refit_window_hours: i64,

    /// Name prefixes that get error recalibration before fitting
    pub recalibrate_prefixes: Vec<String>,

    /// Extra attempts for a failed outcome write
    pub record_retries: u32,

    /// Base backoff for outcome write retries in milliseconds
    pub record_backoff_ms: u64,
}

/// External fitter configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Fitter program; receives `<name> <cores>` and the target JSON on stdin
    pub command: Option<String>,

    /// Extra leading arguments for the fitter program
    pub args: Vec<String>,

    /// Error-recalibration program for prefixed targets
    pub recalibrate_command: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

/// Longest accepted `need` window, ten years
pub const MAX_REFIT_WINDOW_HOURS: i64 = 24 * 365 * 10;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 2] = ["text", "json"];

/// Host core count, falling back to one
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Per-fit share of `host_cores` when `workers` fits run at once
pub fn split_cores(host_cores: usize, workers: usize) -> usize {
    (host_cores / workers.max(1)).max(1)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let backend = match std::env::var("MOP_CATALOG_BACKEND") {
            Ok(v) => v.parse()?,
            Err(_) => defaults.catalog.backend,
        };

        let sqlite_path = std::env::var("MOP_SQLITE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.catalog.sqlite_path);

        let postgres_url = std::env::var("MOP_POSTGRES_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .unwrap_or(defaults.catalog.postgres_url);

        let workers = env_parse("MOP_WORKERS").unwrap_or(defaults.orchestrator.workers);
        let cores_per_fit = env_parse("MOP_CORES_PER_FIT");

        let fit_timeout_secs =
            env_parse("MOP_FIT_TIMEOUT").unwrap_or(defaults.orchestrator.fit_timeout_secs);

        let lease_ttl_secs =
            env_parse("MOP_LEASE_TTL").unwrap_or(defaults.orchestrator.lease_ttl_secs);

        let refit_window_hours =
            env_parse("MOP_REFIT_WINDOW_HOURS").unwrap_or(defaults.orchestrator.refit_window_hours);

        let log_level = std::env::var("MOP_LOG_LEVEL").unwrap_or(defaults.logging.level);
        let log_format = std::env::var("MOP_LOG_FORMAT").unwrap_or(defaults.logging.format);

        Ok(Self {
            catalog: CatalogConfig {
                backend,
                sqlite_path,
                postgres_url,
                ..defaults.catalog
            },
            orchestrator: OrchestratorConfig {
                workers,
                cores_per_fit,
                fit_timeout_secs,
                lease_ttl_secs,
                refit_window_hours,
                ..defaults.orchestrator
            },
            fit: FitConfig {
                command: std::env::var("MOP_FIT_COMMAND").ok(),
                args: Vec::new(),
                recalibrate_command: std::env::var("MOP_RECALIBRATE_COMMAND").ok(),
            },
            tns: TnsConfig {
                api_key: std::env::var("MOP_TNS_API_KEY").ok(),
                ..defaults.tns
            },
            logging: LoggingConfig {
                level: log_level,
                format: log_format,
            },
        })
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }

        if self.orchestrator.fit_timeout_secs == 0 {
            anyhow::bail!("fit_timeout_secs must be greater than 0");
        }

        if self.orchestrator.lease_ttl_secs < 3 {
            anyhow::bail!("lease_ttl_secs must be at least 3");
        }

        if self.orchestrator.cores_per_fit == Some(0) {
            anyhow::bail!("cores_per_fit must be at least 1");
        }

        if !(1..=MAX_REFIT_WINDOW_HOURS).contains(&self.orchestrator.refit_window_hours) {
            anyhow::bail!(
                "refit_window_hours must be between 1 and {MAX_REFIT_WINDOW_HOURS}"
            );
        }

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            anyhow::bail!("unknown log level '{}'", self.logging.level);
        }

        if !LOG_FORMATS.contains(&self.logging.format.as_str()) {
            anyhow::bail!("unknown log format '{}'", self.logging.format);
        }

        if self.catalog.backend == CatalogBackend::Postgres && self.catalog.pool_size == 0 {
            anyhow::bail!("pool_size must be greater than 0");
        }

        Ok(())
    }

    /// Get per-target fit timeout as Duration
    #[must_use]
    pub fn fit_timeout(&self) -> Duration {
        Duration::from_secs(self.orchestrator.fit_timeout_secs)
    }

    /// Cores each fit may use
    #[must_use]
    pub fn cores_per_fit(&self) -> usize {
        self.orchestrator
            .cores_per_fit
            .unwrap_or_else(|| split_cores(default_workers(), self.orchestrator.workers))
    }

    /// Get lease lifetime as Duration
    #[must_use]
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.orchestrator.lease_ttl_secs)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            backend: CatalogBackend::Sqlite,
            sqlite_path: PathBuf::from("data/catalog.db"),
            postgres_url: String::from("postgresql://localhost/mop"),
            pool_size: 4,
            busy_timeout_ms: 5_000,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            cores_per_fit: None,
            fit_timeout_secs: 3_600,
            lease_ttl_secs: 600,
            refit_window_hours: 4,
            recalibrate_prefixes: vec![String::from("Gaia")],
            record_retries: 1,
            record_backoff_ms: 500,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.orchestrator.workers >= 1);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = Config::default();
        config.orchestrator.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_short_lease_rejected() {
        let mut config = Config::default();
        config.orchestrator.lease_ttl_secs = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_refit_window_is_bounded() {
        let mut config = Config::default();
        config.orchestrator.refit_window_hours = MAX_REFIT_WINDOW_HOURS;
        assert!(config.validate().is_ok());

        for hours in [0, MAX_REFIT_WINDOW_HOURS + 1, i64::MAX] {
            config.orchestrator.refit_window_hours = hours;
            assert!(config.validate().is_err(), "{hours}");
        }
    }

    #[test]
    fn test_split_cores() {
        assert_eq!(split_cores(32, 32), 1);
        assert_eq!(split_cores(32, 4), 8);
        assert_eq!(split_cores(6, 4), 1);
        assert_eq!(split_cores(2, 8), 1);
        assert_eq!(split_cores(8, 0), 8);
    }

    #[test]
    fn test_cores_per_fit_never_oversubscribes_by_default() {
        let mut config = Config::default();
        for workers in 1..=default_workers() {
            config.orchestrator.workers = workers;
            assert!(workers * config.cores_per_fit() <= default_workers());
        }

        config.orchestrator.cores_per_fit = Some(3);
        assert_eq!(config.cores_per_fit(), 3);
        config.orchestrator.cores_per_fit = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_logging_values_validated() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeout_conversion() {
        let config = Config::default();
        assert_eq!(config.fit_timeout(), Duration::from_secs(3_600));
        assert_eq!(config.lease_ttl(), Duration::from_secs(600));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [orchestrator]
            workers = 3
            recalibrate_prefixes = ["Gaia", "OGLE"]

            [fit]
            command = "pspl-fit"
            args = ["--parallax"]
            "#,
        )
        .unwrap();

        assert_eq!(config.orchestrator.workers, 3);
        assert_eq!(config.orchestrator.refit_window_hours, 4);
        assert_eq!(config.orchestrator.recalibrate_prefixes.len(), 2);
        assert_eq!(config.fit.command.as_deref(), Some("pspl-fit"));
        assert_eq!(config.catalog.backend, CatalogBackend::Sqlite);
        assert_eq!(config.logging.format, "text");
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!(
            "postgresql".parse::<CatalogBackend>().unwrap(),
            CatalogBackend::Postgres
        );
        assert!("mysql".parse::<CatalogBackend>().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        std::env::set_var("MOP_WORKERS", "7");
        std::env::set_var("MOP_SQLITE_PATH", "/tmp/mop-test.db");
        let config = Config::from_env().unwrap();
        std::env::remove_var("MOP_WORKERS");
        std::env::remove_var("MOP_SQLITE_PATH");

        assert_eq!(config.orchestrator.workers, 7);
        assert_eq!(config.catalog.sqlite_path, PathBuf::from("/tmp/mop-test.db"));
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_unknown_backend() {
        std::env::set_var("MOP_CATALOG_BACKEND", "oracle");
        let result = Config::from_env();
        std::env::remove_var("MOP_CATALOG_BACKEND");
        assert!(result.is_err());
    }
}
