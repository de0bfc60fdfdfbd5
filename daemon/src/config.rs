//! Configuration management for padlink
//!
//! Handles loading and validation of the JSON configuration file.
//! Configuration is stored at `~/.config/padlink/config.json`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::rumble::DEFAULT_KEEPALIVE_MS;

// ============================================================================
// Constants
// ============================================================================

/// Default config directory name
const CONFIG_DIR: &str = "padlink";

/// Default config file name
const CONFIG_FILE: &str = "config.json";

/// Keep-alive bounds; the remote caps a single rumble call at about one second
const MIN_KEEPALIVE_MS: u64 = 50;
const MAX_KEEPALIVE_MS: u64 = 900;

// ============================================================================
// Service Configuration
// ============================================================================

/// Which message bus the accessory service lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    Session,
    System,
}

/// Where to find the remote accessory service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Bus to connect to (default: session)
    #[serde(default)]
    pub bus: BusKind,

    /// Well-known bus name of the service
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Object path of the accessory interface
    #[serde(default = "default_service_path")]
    pub path: String,
}

fn default_service_name() -> String {
    crate::dbus::DEFAULT_SERVICE_NAME.to_string()
}

fn default_service_path() -> String {
    crate::dbus::DEFAULT_SERVICE_PATH.to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bus: BusKind::default(),
            name: default_service_name(),
            path: default_service_path(),
        }
    }
}

// ============================================================================
// Rumble Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RumbleConfig {
    /// Interval between keep-alive re-issues (default: 500)
    #[serde(default = "default_keepalive")]
    pub keepalive_interval_ms: u64,
}

fn default_keepalive() -> u64 { DEFAULT_KEEPALIVE_MS }

impl Default for RumbleConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: DEFAULT_KEEPALIVE_MS,
        }
    }
}

impl RumbleConfig {
    /// Clamp the keep-alive interval to 50-900 ms
    pub fn validate(&mut self) {
        self.keepalive_interval_ms = self
            .keepalive_interval_ms
            .clamp(MIN_KEEPALIVE_MS, MAX_KEEPALIVE_MS);
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
}

// ============================================================================
// Main Configuration
// ============================================================================

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub rumble: RumbleConfig,

    /// Configuration file path (not serialized)
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

impl Config {
    /// Get the default config directory path
    pub fn default_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join(CONFIG_DIR))
    }

    /// Get the default config file path
    pub fn default_config_path() -> Option<PathBuf> {
        Self::default_config_dir().map(|p| p.join(CONFIG_FILE))
    }

    /// Load configuration from the default location
    ///
    /// Returns default config if file doesn't exist.
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_config_path() {
            Some(path) => Self::load(&path),
            None => {
                tracing::warn!("Could not determine config directory, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from file path
    ///
    /// Returns default config if file doesn't exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            let mut config = Self::default();
            config.config_path = Some(path.to_path_buf());
            return Ok(config);
        }

        let contents = fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&contents)?;

        config.validate()?;
        config.config_path = Some(path.to_path_buf());

        tracing::info!(
            path = %path.display(),
            bus = ?config.service.bus,
            service = %config.service.name,
            keepalive_ms = config.rumble.keepalive_interval_ms,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Clamp tunables and reject unusable service coordinates
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.rumble.validate();

        if self.service.name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "service.name must not be empty".to_string(),
            ));
        }
        if !self.service.path.starts_with('/') {
            return Err(ConfigError::ValidationError(format!(
                "service.path must be an absolute object path, got {:?}",
                self.service.path
            )));
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = match &self.config_path {
            Some(p) => p.clone(),
            None => Self::default_config_path()
                .ok_or_else(|| ConfigError::ValidationError("No config path".to_string()))?,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(self)?;
        fs::write(&path, contents)?;

        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading/writing file
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    /// JSON parsing error
    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    ValidationError(String),
}

// ============================================================================
// Tests
// ============================================================================
