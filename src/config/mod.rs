mod types;

pub use types::*;

use crate::error::{BackupError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".tlm_backup"))
        .unwrap_or_else(|| PathBuf::from(".tlm_backup"))
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

pub fn load() -> Result<AppConfig> {
    load_from(&config_path())
}

pub fn load_from(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        debug!("Config file not found at {:?}, using defaults", path);
        return Ok(AppConfig::default());
    }

    info!("Loading configuration from {:?}", path);
    let contents = fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&contents)?;
    Ok(config)
}

impl AppConfig {
    /// The `[destination]` section, which every backup requires.
    pub fn destination(&self) -> Result<&DestinationConfig> {
        self.destination
            .as_ref()
            .ok_or_else(|| BackupError::Config("missing [destination] section".to_string()))
    }

    pub fn mysql(&self) -> Result<&MysqlConfig> {
        self.mysql
            .as_ref()
            .ok_or_else(|| BackupError::Config("missing [mysql] section".to_string()))
    }

    pub fn hostname(&self) -> String {
        if let Some(name) = &self.source.hostname {
            return name.clone();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string())
    }
}
