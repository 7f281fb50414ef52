//! Initialize the configuration directory: create ~/.relay and a default config file.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::Config;

/// Create the config directory and a default `config.json` if they do not exist.
/// An existing config file is left untouched. Returns the config directory.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if config_path.exists() {
        log::debug!("config already exists at {}, skipping", config_path.display());
    } else {
        let default_config = serde_json::to_string_pretty(&Config::default())
            .context("serializing default config")?;
        std::fs::write(config_path, default_config)
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    }

    Ok(config_dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_loadable_default_once() {
        let dir = std::env::temp_dir().join(format!("relay-init-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("config.json");
        let created = init_config_dir(&path).unwrap();
        assert_eq!(created, dir.join("nested"));
        let (config, _) = crate::config::load_config(Some(path.clone())).unwrap();
        assert_eq!(config.gateway.port, 15180);

        std::fs::write(&path, r#"{"gateway":{"port":1}}"#).unwrap();
        init_config_dir(&path).unwrap();
        let (config, _) = crate::config::load_config(Some(path)).unwrap();
        assert_eq!(config.gateway.port, 1);
        let _ = std::fs::remove_dir_all(dir);
    }
}
