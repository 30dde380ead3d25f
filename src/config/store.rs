use std::path::{Path, PathBuf};

use super::AppConfig;
use crate::error::Result;

/// Default config file name, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "twinview.toml";

/// Environment variable overriding the config path
pub const CONFIG_ENV: &str = "TWINVIEW_CONFIG";

/// Resolve the config path: CLI argument, then environment, then default
pub fn resolve_config_path(cli: Option<PathBuf>) -> PathBuf {
    cli.or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Load configuration from a TOML file
///
/// A missing file is not an error: defaults are used so a fresh device
/// can start with only CLI overrides.
pub async fn load_config(path: &Path) -> Result<AppConfig> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        tracing::info!("Config file {} not found, using defaults", path.display());
        return Ok(AppConfig::default());
    }

    let text = tokio::fs::read_to_string(path).await?;
    let config: AppConfig = toml::from_str(&text)?;
    tracing::debug!("Loaded configuration from {}", path.display());
    Ok(config)
}
