mod types;

pub use types::*;

use anyhow::{Context, Result};
use reliquary_core::BackendKind;
use std::path::Path;

/// Load configuration from a TOML file.
///
/// A relative SQLite path is taken relative to the config file's directory.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let mut config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    resolve_paths(&mut config, base);

    validate_config(&config)?;

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    let default_paths = ["./reliquary.toml", "~/.config/reliquary/config.toml"];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            return load_config(path);
        }
    }

    Ok(Config::default())
}

fn resolve_paths(config: &mut Config, base: &Path) {
    let sqlite = &mut config.storage.sqlite;
    let raw = sqlite.path.to_string_lossy().into_owned();
    if raw == ":memory:" {
        return;
    }

    let expanded = shellexpand::tilde(&raw).into_owned();
    let path = Path::new(&expanded);
    sqlite.path = if path.is_relative() {
        base.join(path)
    } else {
        path.to_path_buf()
    };
}

fn validate_config(config: &Config) -> Result<()> {
    config
        .storage
        .validate()
        .context("Invalid [storage] section")?;

    if config.storage.backend == BackendKind::Mysql && !cfg!(feature = "mysql") {
        tracing::warn!("MySQL backend selected but this build lacks the `mysql` feature");
    }

    Ok(())
}
