//! `promptloom config`: configuration management commands.

use super::{CliResult, load_config};
use promptloom_config::AppConfig;
use std::path::{Path, PathBuf};

fn config_path() -> PathBuf {
    AppConfig::config_dir().join("config.toml")
}

/// Write the default configuration to `path`. Returns `false` when a file
/// already exists and `force` is not set.
pub fn write_default(path: &Path, force: bool) -> std::io::Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, AppConfig::default_toml())?;
    Ok(true)
}

pub async fn init(force: bool) -> CliResult {
    let path = config_path();
    if write_default(&path, force)? {
        println!("Wrote default configuration to {}", path.display());
    } else {
        println!("{} already exists (use --force to overwrite)", path.display());
    }
    Ok(())
}

pub async fn show() -> CliResult {
    let mut config = load_config()?;
    if config.api_key.is_some() {
        config.api_key = Some("***".into());
    }
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

pub async fn path() -> CliResult {
    println!("{}", config_path().display());
    Ok(())
}
