use anyhow::{Context, Result};
use backup_core::BackupConfig;
use std::path::PathBuf;

pub const CONFIG_FILE_NAME: &str = "backupd.toml";

/// Load the config from `explicit`, or from the per-user default location.
pub fn load(explicit: Option<PathBuf>) -> Result<(PathBuf, BackupConfig)> {
    let path = match explicit {
        Some(path) => path,
        None => default_config_path()?,
    };
    let config = BackupConfig::load(&path)
        .with_context(|| format!("Failed to load config {}", path.display()))?;
    Ok((path, config))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

fn config_dir() -> Result<PathBuf> {
    if let Some(base) = dirs::data_dir() {
        return Ok(base.join("atlas").join("backupd"));
    }
    if let Some(home) = dirs::home_dir() {
        return Ok(home.join(".atlas").join("backupd"));
    }
    anyhow::bail!("Unable to resolve a data directory, pass --config")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shipped_example_config_is_valid() {
        let config = BackupConfig::from_toml(include_str!("../backupd.example.toml"))
            .expect("parse example");
        config.validate().expect("example validates");
        assert_eq!(config.sources.len(), 3);
        assert_eq!(config.sources[2].max_archives(), Some(2));
        // unset templates keep their defaults
        assert!(config.messages.autosave_start.contains("Autosave"));
    }

    #[test]
    fn default_path_ends_with_the_config_file_name() {
        if let Ok(path) = default_config_path() {
            assert!(path.ends_with(CONFIG_FILE_NAME));
        }
    }
}
