//! Configuration management for cryptsync

use crate::crypto::DEFAULT_ITERATIONS;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// Default interval between queue drains in `watch` mode (milliseconds)
pub const DEFAULT_DRAIN_INTERVAL_MS: u64 = 1000;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Key derivation settings for the destination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// PBKDF2 salt; empty selects the built-in default salt
    #[serde(with = "hex_serde", default)]
    pub salt: Vec<u8>,

    /// PBKDF2 iteration count
    #[serde(default = "default_iterations")]
    pub iterations: u32,
}

fn default_iterations() -> u32 {
    DEFAULT_ITERATIONS
}

/// Task pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// How often `watch` drains the task queue
    #[serde(default = "default_drain_interval")]
    pub drain_interval_ms: u64,
}

fn default_drain_interval() -> u64 {
    DEFAULT_DRAIN_INTERVAL_MS
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path
    pub file: Option<PathBuf>,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Plaintext tree to mirror
    pub source: PathBuf,

    /// Root of the encrypted mirror
    pub destination: PathBuf,

    #[serde(default)]
    pub encryption: EncryptionConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        EncryptionConfig {
            salt: Vec::new(),
            iterations: DEFAULT_ITERATIONS,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            drain_interval_ms: DEFAULT_DRAIN_INTERVAL_MS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cryptsync");

        Config {
            source: PathBuf::from("."),
            destination: data_dir.join("mirror"),
            encryption: EncryptionConfig::default(),
            sync: SyncConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EncryptionConfig {
    /// Explicit salt, or `None` for the default
    pub fn salt(&self) -> Option<&[u8]> {
        if self.salt.is_empty() {
            None
        } else {
            Some(&self.salt)
        }
    }
}

impl Config {
    /// Default location of the configuration file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cryptsync")
            .join("config.json")
    }

    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        // Override with environment variables if set
        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| var(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(source) = non_empty("CRYPTSYNC_SOURCE") {
            self.source = PathBuf::from(source);
        }

        if let Some(destination) = non_empty("CRYPTSYNC_DESTINATION") {
            self.destination = PathBuf::from(destination);
        }

        if let Some(iterations) = non_empty("CRYPTSYNC_ITERATIONS") {
            if let Ok(iterations) = iterations.parse::<u32>() {
                self.encryption.iterations = iterations;
            }
        }

        if let Some(level) = non_empty("CRYPTSYNC_LOG_LEVEL") {
            self.logging.level = level.to_lowercase();
        }
    }

    /// Create a new config from environment variables only (for init without existing config)
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        for key in ["CRYPTSYNC_SOURCE", "CRYPTSYNC_DESTINATION"] {
            if var(key).map_or(true, |v| v.trim().is_empty()) {
                return Err(Error::InvalidConfig(format!(
                    "{} environment variable is required",
                    key
                )));
            }
        }

        let mut config = Config::default();
        config.apply_overrides(var);
        config.validate()?;
        Ok(config)
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
        if self.source.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("Source path is required".to_string()));
        }

        if self.destination.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "Destination path is required".to_string(),
            ));
        }

        let source = normalize(&self.source)?;
        let destination = normalize(&self.destination)?;
        if destination.starts_with(&source) {
            return Err(Error::InvalidConfig(
                "Destination must not be inside the source tree".to_string(),
            ));
        }

        if self.encryption.iterations == 0 {
            return Err(Error::InvalidConfig(
                "Iteration count must be greater than 0".to_string(),
            ));
        }

        if self.sync.drain_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "Drain interval must be greater than 0".to_string(),
            ));
        }

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(Error::InvalidConfig(format!(
                "Unknown log level '{}'",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.destination)?;
        if let Some(parent) = self.logging.file.as_ref().and_then(|f| f.parent()) {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

/// Absolute form of `path` with `.` and `..` resolved lexically
fn normalize(path: &Path) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in std::path::absolute(path)?.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    Ok(normalized)
}

/// Hex serialization for byte arrays
mod hex_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(Vec::new());
        }
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
