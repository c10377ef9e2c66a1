//! CLI configuration loading.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tidesync_core::EngineConfig;

/// Default config path: `<config dir>/tidesync/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tidesync")
        .join("config.toml")
}

/// Default data directory: `<data dir>/tidesync`.
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tidesync")
}

/// Load the engine configuration from a TOML file, filling in the data
/// directory when the file leaves it unset.
pub fn load(path: &Path) -> Result<EngineConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let mut config: EngineConfig =
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
    if config.data_dir.as_os_str().is_empty() {
        config.data_dir = default_data_dir();
    }
    Ok(config)
}
