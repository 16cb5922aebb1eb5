use anyhow::{Context, Result};
use lowband_sync::SyncConfig;
use std::path::{Path, PathBuf};

/// Environment variable holding the bearer token
pub const TOKEN_ENV: &str = "LOWBAND_TOKEN";

/// Get the path to the config file
pub fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Home directory not found")?;
    Ok(home.join(".lowband").join("config.toml"))
}

/// Write `config` to `path`, creating the directory if needed
pub fn save(config: &SyncConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
    }

    let content = toml::to_string_pretty(config).context("Failed to serialize config to TOML")?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;

    Ok(())
}

/// Load the config at `path`. A missing file yields the defaults.
///
/// A relative `store.path` is resolved against the config file's directory.
pub fn load(path: &Path) -> Result<SyncConfig> {
    let mut config = if path.exists() {
        SyncConfig::load(path)
            .with_context(|| format!("Failed to load config file: {}", path.display()))?
    } else {
        SyncConfig::default()
    };

    if config.store.path.is_relative() {
        if let Some(dir) = path.parent() {
            config.store.path = dir.join(&config.store.path);
        }
    }
    Ok(config)
}

/// Bearer token from the environment
pub fn token() -> Result<String> {
    std::env::var(TOKEN_ENV).with_context(|| format!("{} is not set", TOKEN_ENV))
}
