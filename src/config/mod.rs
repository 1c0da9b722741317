//! Configuration management
//!
//! Everything has a working default: the broker expects its Python tree in
//! `python/` next to the executable and puts the endpoint socket in the
//! system temp directory, so both processes agree with no configuration at
//! all. A TOML file can override either location.

use crate::protocol::crypto;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
}

/// General settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Root of the bundled Python tree (defaults to `python/` next to the
    /// broker executable)
    pub python_home: Option<PathBuf>,

    /// Explicit interpreter override (defaults to the bundled interpreter,
    /// then `python3` from PATH)
    pub python_executable: Option<PathBuf>,

    /// Directory holding the endpoint socket (defaults to the system temp
    /// directory)
    pub runtime_dir: Option<PathBuf>,
}

impl Config {
    /// Load config from file, or return defaults if not found
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pyengine")
            .join("config.toml")
    }

    /// Directory the endpoint socket lives in
    pub fn runtime_dir(&self) -> PathBuf {
        self.general
            .runtime_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Full endpoint socket path; the file name is the per-host derived
    /// endpoint name, so broker and clients agree without coordination
    pub fn socket_path(&self) -> PathBuf {
        self.runtime_dir()
            .join(format!("{}.sock", crypto::endpoint_name()))
    }
}
