use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::archive::DEFAULT_COMPRESSION_LEVEL;
use crate::errors::BackupError;

/// One hundred years.
const MAX_PERIOD_SECONDS: i64 = 100 * 365 * 24 * 60 * 60;

/// Daemon configuration, loaded once and handed to each component.
///
/// Numeric settings are signed so that zero and negative values reach
/// [`BackupConfig::validate`] instead of failing deserialization with a
/// confusing message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_backup_interval")]
    pub backup_interval_seconds: i64,
    #[serde(default = "default_max_backups")]
    pub max_backups: i64,
    #[serde(default = "default_backup_directory")]
    pub backup_directory: PathBuf,
    #[serde(default = "default_checkpoint_timeout")]
    pub checkpoint_timeout_seconds: i64,
    #[serde(default)]
    pub autosave_interval_seconds: Option<i64>,
    #[serde(default = "default_compression_level")]
    pub compression_level: i64,
    #[serde(default)]
    pub server: Option<ServerConfig>,
    #[serde(default)]
    pub messages: MessagesConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub backup_directory: Option<PathBuf>,
    #[serde(default)]
    pub max_backups: Option<i64>,
}

/// How to reach the game server that owns the sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub rcon_address: Option<String>,
    #[serde(default)]
    pub rcon_password: Option<String>,
    /// Directory holding `server.properties`, used when no address is given.
    #[serde(default)]
    pub server_dir: Option<PathBuf>,
    /// Turn autosave off while a world is being archived.
    #[serde(default = "default_true")]
    pub hold_saves: bool,
    #[serde(default = "default_true")]
    pub broadcast: bool,
}

/// In-game chat lines. `&` colour codes are allowed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagesConfig {
    pub backup_start: String,
    pub backup_complete: String,
    pub backup_failed: String,
    pub autosave_start: String,
    pub autosave_complete: String,
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            backup_start: "&6[Backup] &eStarting world backup...".to_string(),
            backup_complete: "&6[Backup] &aBackup complete, {count} world(s) saved.".to_string(),
            backup_failed: "&6[Backup] &c{failed} world(s) could not be backed up.".to_string(),
            autosave_start: "&6[Autosave] &eSaving worlds...".to_string(),
            autosave_complete: "&6[Autosave] &aWorlds saved.".to_string(),
        }
    }
}

impl BackupConfig {
    /// Read, resolve and validate a TOML config file. Relative paths are taken
    /// relative to the file's directory.
    pub fn load(path: &Path) -> Result<Self, BackupError> {
        let content =
            fs::read_to_string(path).map_err(|e| BackupError::io("reading config", path, e))?;
        let mut config = Self::from_toml(&content)?;
        let base = path.parent().unwrap_or(Path::new("."));
        config.resolve_paths(base);
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, BackupError> {
        toml::from_str(content).map_err(|e| BackupError::config(format!("malformed config: {e}")))
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        self.backup_directory = resolve(base, &self.backup_directory);
        for source in &mut self.sources {
            source.path = resolve(base, &source.path);
            if let Some(dir) = source.backup_directory.as_mut() {
                *dir = resolve(base, dir);
            }
        }
        if let Some(server) = self.server.as_mut() {
            if let Some(dir) = server.server_dir.as_mut() {
                *dir = resolve(base, dir);
            }
        }
    }

    pub fn validate(&self) -> Result<(), BackupError> {
        period("backup_interval_seconds", self.backup_interval_seconds)?;
        positive("max_backups", self.max_backups)?;
        period("checkpoint_timeout_seconds", self.checkpoint_timeout_seconds)?;
        if let Some(autosave) = self.autosave_interval_seconds {
            period("autosave_interval_seconds", autosave)?;
        }
        if !(0..=9).contains(&self.compression_level) {
            return Err(BackupError::config(format!(
                "compression_level must be between 0 and 9, got {}",
                self.compression_level
            )));
        }
        if self.backup_directory.as_os_str().is_empty() {
            return Err(BackupError::config("backup_directory must not be empty"));
        }
        if self.sources.is_empty() {
            return Err(BackupError::config("at least one [[sources]] entry is required"));
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            let name = source.name.trim();
            if name.is_empty() {
                return Err(BackupError::config("source name must not be empty"));
            }
            if name != source.name || name.contains(['/', '\\']) || name == "." || name == ".." {
                return Err(BackupError::config(format!(
                    "source name {:?} must be a plain file name",
                    source.name
                )));
            }
            if !seen.insert(name) {
                return Err(BackupError::config(format!("duplicate source name {name:?}")));
            }
            if source.path.as_os_str().is_empty() {
                return Err(BackupError::config(format!("source {name:?} has an empty path")));
            }
            if let Some(max) = source.max_backups {
                positive("sources.max_backups", max)?;
            }
        }

        if let Some(server) = &self.server {
            let has_address = server.rcon_address.is_some() || server.rcon_password.is_some();
            if has_address && (server.rcon_address.is_none() || server.rcon_password.is_none()) {
                return Err(BackupError::config(
                    "server.rcon_address and server.rcon_password must be set together",
                ));
            }
            if !has_address && server.server_dir.is_none() {
                return Err(BackupError::config(
                    "server needs either rcon_address/rcon_password or server_dir",
                ));
            }
        }
        Ok(())
    }

    pub fn backup_interval(&self) -> Duration {
        seconds(self.backup_interval_seconds)
    }

    pub fn checkpoint_timeout(&self) -> Duration {
        seconds(self.checkpoint_timeout_seconds)
    }

    pub fn autosave_interval(&self) -> Option<Duration> {
        self.autosave_interval_seconds.map(seconds)
    }

    pub fn max_archives(&self) -> usize {
        usize::try_from(self.max_backups).unwrap_or(0)
    }

    pub fn compression_level(&self) -> u32 {
        u32::try_from(self.compression_level).unwrap_or(DEFAULT_COMPRESSION_LEVEL)
    }

    /// Directory `source`'s archives go to.
    pub fn archive_dir_for(&self, source: &SourceConfig) -> PathBuf {
        source
            .backup_directory
            .clone()
            .unwrap_or_else(|| self.backup_directory.clone())
    }

    /// The global backup directory followed by every per-source override.
    pub fn archive_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = vec![self.backup_directory.clone()];
        dirs.extend(self.sources.iter().filter_map(|s| s.backup_directory.clone()));
        dirs
    }

    /// Create every archive directory. Failure here is fatal at startup.
    pub fn ensure_directories(&self) -> Result<(), BackupError> {
        for dir in self.archive_dirs() {
            fs::create_dir_all(&dir)
                .map_err(|e| BackupError::io("creating backup directory", &dir, e))?;
        }
        Ok(())
    }
}

impl SourceConfig {
    pub fn max_archives(&self) -> Option<usize> {
        self.max_backups.and_then(|max| usize::try_from(max).ok())
    }
}

fn positive(key: &str, value: i64) -> Result<(), BackupError> {
    if value <= 0 {
        return Err(BackupError::config(format!(
            "{key} must be greater than zero, got {value}"
        )));
    }
    Ok(())
}

/// A positive number of seconds that a timer can still be armed with.
fn period(key: &str, value: i64) -> Result<(), BackupError> {
    positive(key, value)?;
    if value > MAX_PERIOD_SECONDS {
        return Err(BackupError::config(format!(
            "{key} must be at most {MAX_PERIOD_SECONDS}, got {value}"
        )));
    }
    Ok(())
}

fn seconds(value: i64) -> Duration {
    Duration::from_secs(u64::try_from(value).unwrap_or(0))
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() { path.to_path_buf() } else { base.join(path) }
}

fn default_backup_interval() -> i64 {
    60 * 60
}

fn default_max_backups() -> i64 {
    5
}

fn default_backup_directory() -> PathBuf {
    PathBuf::from("backups")
}

fn default_checkpoint_timeout() -> i64 {
    60
}

fn default_compression_level() -> i64 {
    i64::from(DEFAULT_COMPRESSION_LEVEL)
}

fn default_true() -> bool {
    true
}
