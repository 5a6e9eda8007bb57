mod classify;
mod fit;
mod status;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use mop_orchestrator::config::{CatalogBackend, Config, LoggingConfig};

// Re-export command functions for convenience
pub use classify::classify;
pub use fit::{fit, FitParams};
pub use status::status;

/// Load configuration from a file or the environment, apply the database
/// override, and validate
fn load_config(path: Option<&Path>, database: Option<PathBuf>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env().context("Failed to read configuration from environment")?,
    };

    if let Some(database) = database {
        config.catalog.backend = CatalogBackend::Sqlite;
        config.catalog.sqlite_path = database;
    }

    Ok(config)
}

/// Logging section of the configuration the command will load.
///
/// Runs before tracing is up, so a config that fails to load falls back to
/// the defaults here and is reported once the command loads it for real.
pub fn logging_config(path: Option<&Path>) -> LoggingConfig {
    let loaded = match path {
        Some(path) => Config::from_file(path),
        None => Config::from_env(),
    };
    loaded.map(|config| config.logging).unwrap_or_default()
}
