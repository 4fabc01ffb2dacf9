//! CLI-side configuration: locating the routing file and assembling the router

use anyhow::{Context, Result};
use foundry_core::config::foundry_dir;
use foundry_core::{ConfigSource, Router};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const CONFIG_FILE: &str = "llm_routing.toml";

/// Written by `foundry init`
pub const DEFAULT_CONFIG: &str = include_str!("../../../config/llm_routing.toml");

/// `~/.foundry`
pub fn config_dir() -> PathBuf {
    foundry_dir()
}

/// The `--config` path if given, otherwise `~/.foundry/llm_routing.toml`
pub fn resolve_path(custom_path: &Option<PathBuf>) -> PathBuf {
    custom_path
        .clone()
        .unwrap_or_else(|| config_dir().join(CONFIG_FILE))
}

/// Build a router from the resolved config file. A missing file means built-in defaults.
pub fn build_router(custom_path: &Option<PathBuf>) -> Result<Router> {
    let path = resolve_path(custom_path);
    if !path.exists() {
        warn!(
            "No config at {}, using built-in defaults (run `foundry init` to create one)",
            path.display()
        );
    }
    Router::builder()
        .source(ConfigSource::file(&path))
        .build()
        .with_context(|| format!("Failed to load routing config from {}", path.display()))
}

/// Write the default config unless one exists. Returns whether a file was written.
pub fn write_default_config(path: &Path, force: bool) -> Result<bool> {
    if path.exists() && !force {
        warn!("Config already exists at {}", path.display());
        return Ok(false);
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config dir: {}", parent.display()))?;
    }
    std::fs::write(path, DEFAULT_CONFIG)
        .with_context(|| format!("Failed to write config: {}", path.display()))?;
    info!("Created default config at {}", path.display());
    Ok(true)
}
