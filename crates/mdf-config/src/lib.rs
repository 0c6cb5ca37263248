//! # mdf-config
//!
//! Configuration management for the mdfstore upload backend.
//!
//! Loads configuration from:
//! 1. `~/.mdfstore/config.toml` (global)
//! 2. `.mdfstore/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub use logging::LogLevel;

/// Default upload directory, relative to the working directory
pub const DEFAULT_UPLOAD_DIR: &str = "./data";

/// Grace period between upload completion and converter launch
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 500;

/// Global config instance, loaded on first use
static CONFIG: Lazy<Config> = Lazy::new(|| Config::load().unwrap_or_default());

/// Get global config (read-only)
pub fn config() -> &'static Config {
    &CONFIG
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub converter: ConverterConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Load global config (~/.mdfstore/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                config = Self::load_from(&global_path)?;
            }
        }

        // 2. Load project config (.mdfstore/config.toml) - overrides global
        let project_path = Path::new(".mdfstore/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            config.merge(Self::load_from(project_path)?);
        }

        // 3. Apply environment variable overrides
        config.apply_env_overrides();

        Ok(config)
    }

    /// Load a single config file without consulting any other source
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: ~/.mdfstore/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".mdfstore/config.toml"))
    }

    /// Merge another config (project overrides).
    ///
    /// Only values that differ from the defaults replace ours.
    pub fn merge(&mut self, other: Config) {
        let defaults = Config::default();

        if other.storage.upload_dir != defaults.storage.upload_dir {
            self.storage.upload_dir = other.storage.upload_dir;
        }
        if other.storage.create_missing_root {
            self.storage.create_missing_root = true;
        }
        if other.converter.program.is_some() {
            self.converter.program = other.converter.program;
        }
        if other.converter.interpreter.is_some() {
            self.converter.interpreter = other.converter.interpreter;
        }
        if other.converter.settle_delay_ms != defaults.converter.settle_delay_ms {
            self.converter.settle_delay_ms = other.converter.settle_delay_ms;
        }
        if other.converter.exit_policy != defaults.converter.exit_policy {
            self.converter.exit_policy = other.converter.exit_policy;
        }
        if other.logging.level != defaults.logging.level {
            self.logging.level = other.logging.level;
        }
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `MDF_*` overrides looked up through `var`.
    ///
    /// Values that do not parse are ignored with a warning.
    pub fn apply_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = var("MDF_UPLOAD_DIR") {
            self.storage.upload_dir = PathBuf::from(path);
        }
        if let Some(program) = var("MDF_CONVERTER") {
            self.converter.program = Some(PathBuf::from(program));
        }
        if let Some(interpreter) = var("MDF_CONVERTER_INTERPRETER") {
            self.converter.interpreter = Some(interpreter);
        }
        if let Some(delay) = var("MDF_SETTLE_DELAY_MS") {
            match delay.parse() {
                Ok(ms) => self.converter.settle_delay_ms = ms,
                Err(_) => warn!("Ignoring invalid MDF_SETTLE_DELAY_MS={:?}", delay),
            }
        }
        if let Some(level) = var("MDF_LOG_LEVEL") {
            match level.parse::<LogLevel>() {
                Ok(level) => self.logging.level = level,
                Err(e) => warn!("Ignoring MDF_LOG_LEVEL: {}", e),
            }
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding `<id>.bin`, `<id>.info` and `<id>.lock` files
    pub upload_dir: PathBuf,
    /// Create the upload directory on startup instead of failing with
    /// a missing-root error on first use
    pub create_missing_root: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            create_missing_root: false,
        }
    }
}

/// What a non-zero converter exit means for the finished upload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitPolicy {
    /// Non-zero exit is reported as an error
    #[default]
    Strict,
    /// Non-zero exit is logged and otherwise ignored
    Ignore,
}

/// Post-processing converter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// Converter executable or script. No post-processing when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<PathBuf>,
    /// Optional interpreter the program is passed to (e.g. `python3`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,
    /// Delay before the converter is launched, in milliseconds
    pub settle_delay_ms: u64,
    pub exit_policy: ExitPolicy,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            program: None,
            interpreter: None,
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            exit_policy: ExitPolicy::default(),
        }
    }
}

impl ConverterConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
}
