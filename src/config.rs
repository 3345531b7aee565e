//! Configuration management for stackfs

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Environment variable overriding the data directory
pub const HOME_ENV: &str = "STACKFS_HOME";

/// Environment variable overriding the log filter
pub const LOG_ENV: &str = "STACKFS_LOG";

/// Inode numbers below this are never handed out by a mount
pub const MIN_INODE: u64 = 1024;

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Allow other users to access the mount
    #[serde(default)]
    pub allow_other: bool,

    /// Unmount automatically when the process exits
    #[serde(default = "default_auto_unmount")]
    pub auto_unmount: bool,

    /// Base layers stacked under every mount unless overridden on the command line
    #[serde(default)]
    pub layers: Vec<String>,
}

fn default_auto_unmount() -> bool {
    true
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            allow_other: false,
            auto_unmount: default_auto_unmount(),
            layers: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or tracing directives
    /// such as `stackfs=debug,sled=warn`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory holding the database and backing files
    pub home: PathBuf,

    /// Mount configuration
    #[serde(default)]
    pub mount: MountConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("stackfs");

        Config {
            home,
            mount: MountConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            return Self::load(path);
        }

        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(home) = std::env::var(HOME_ENV) {
            let home = home.trim();
            if !home.is_empty() {
                self.home = PathBuf::from(home);
            }
        }

        if let Ok(level) = std::env::var(LOG_ENV) {
            let level = level.trim().to_string();
            if !level.is_empty() {
                self.logging.level = level;
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.home.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "Data directory must not be empty".to_string(),
            ));
        }

        if let Some(layer) = self.mount.layers.iter().find(|l| !is_valid_layer_id(l)) {
            return Err(Error::InvalidConfig(format!(
                "Invalid layer id {:?}: must be non-empty and must not contain '!'",
                layer
            )));
        }

        let level = self.logging.level.as_str();
        let plain = matches!(
            level.to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        );
        if plain || (level.contains('=') && EnvFilter::try_new(level).is_ok()) {
            Ok(())
        } else {
            Err(Error::InvalidConfig(format!("Unknown log level: {}", level)))
        }
    }

    /// Path of the sled database
    pub fn db_path(&self) -> PathBuf {
        self.home.join("db")
    }
}

/// Layer ids are key prefixes, so they cannot contain the key separator
pub fn is_valid_layer_id(id: &str) -> bool {
    !id.is_empty() && !id.contains('!')
}
