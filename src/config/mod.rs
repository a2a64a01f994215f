//! Configuration file handling
//!
//! The file is optional. A missing file means defaults; a present but
//! unparseable or inconsistent one is `ConfigInvalid`.

pub mod schema;

pub use schema::{Config, Stack};

use crate::error::{KilnError, KilnResult};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Locates, loads and writes the config file
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Manager for `~/.config/kiln/config.toml`
    pub fn new() -> Self {
        Self::with_path(Self::default_config_path())
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// `--config` / `KILN_CONFIG` when given, the default location otherwise
    pub fn from_override(path: Option<PathBuf>) -> Self {
        path.map(Self::with_path).unwrap_or_default()
    }

    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kiln")
            .join("config.toml")
    }

    /// Where kiln keeps files that are neither config nor cache
    pub fn state_dir() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kiln")
    }

    pub fn audit_log_path() -> PathBuf {
        Self::state_dir().join("audit.log")
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    pub async fn load(&self) -> KilnResult<Config> {
        let content = match fs::read_to_string(&self.config_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", self.config_path.display());
                return Ok(Config::default());
            }
            Err(e) => {
                return Err(KilnError::io(
                    format!("reading config from {}", self.config_path.display()),
                    e,
                ))
            }
        };

        let config: Config = toml::from_str(&content).map_err(|e| self.invalid(e.to_string()))?;
        let config = config.with_builtin_stack();
        self.validate(&config)?;
        Ok(config)
    }

    fn invalid(&self, reason: String) -> KilnError {
        KilnError::ConfigInvalid {
            path: self.config_path.clone(),
            reason,
        }
    }

    /// Stack ids are unique and the default stack exists
    fn validate(&self, config: &Config) -> KilnResult<()> {
        let mut seen = HashSet::new();
        if let Some(dup) = config.stacks.iter().find(|s| !seen.insert(s.id.as_str())) {
            return Err(self.invalid(format!("stack {} is declared twice", dup.id)));
        }
        if config.stack(None).is_none() {
            return Err(self.invalid(format!(
                "default_stack_id {} names no declared stack",
                config.default_stack_id
            )));
        }
        Ok(())
    }

    /// Write `config`, creating the parent directory
    pub async fn save(&self, config: &Config) -> KilnResult<()> {
        if let Some(dir) = self.config_path.parent() {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| KilnError::ConfigDirCreate {
                    path: dir.to_path_buf(),
                    source: e,
                })?;
        }

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            KilnError::io(format!("writing config to {}", self.config_path.display()), e)
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
