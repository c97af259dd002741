//! Configuration file support for odinflash.
//!
//! Configuration is loaded from multiple sources with the following priority
//! (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (ODINFLASH_*)
//! 3. Local config file (./odinflash.toml)
//! 4. Global config file (~/.config/odinflash/config.toml)

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub serial: Option<String>,
}

/// Flash configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Base directory for PIT backups.
    pub backup_dir: Option<PathBuf>,
    /// Reboot to normal mode after flashing instead of plain ENDS.
    #[serde(default)]
    pub auto_reboot: bool,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Flash settings.
    #[serde(default)]
    pub flash: FlashConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                if let Some(global_config) = Self::load_from_file(&global_path) {
                    debug!("Loaded global config from {}", global_path.display());
                    config.merge(global_config);
                }
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new("odinflash.toml")) {
            debug!("Loaded local config from odinflash.toml");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from an explicit path only.
    pub fn load_from_path(path: &Path) -> Self {
        match Self::load_from_file(path) {
            Some(config) => config,
            None => {
                warn!("Could not read config from {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        match toml::from_str(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("Ignoring malformed config {}: {e}", path.display());
                None
            }
        }
    }

    /// Overlay `other` on top of this config; set fields win.
    pub fn merge(&mut self, other: Self) {
        if other.connection.serial.is_some() {
            self.connection.serial = other.connection.serial;
        }
        if other.flash.backup_dir.is_some() {
            self.flash.backup_dir = other.flash.backup_dir;
        }
        if other.flash.auto_reboot {
            self.flash.auto_reboot = true;
        }
    }

    /// Path of the global configuration file.
    pub fn global_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "odinflash")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Persist the preferred port to the global configuration file.
    pub fn remember_port(&mut self, port_name: &str) -> std::io::Result<()> {
        self.connection.serial = Some(port_name.to_string());
        let Some(path) = Self::global_config_path() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(&path, rendered)?;
        debug!("Saved preferred port {port_name} to {}", path.display());
        Ok(())
    }
}
