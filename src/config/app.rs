//! Application configuration structures.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::types_db::TypesDb;
use super::validation::{ConfigError, option_pairs};
use crate::types::{DataSet, SchemaLookup};

// =============================================================================
// Constants
// =============================================================================

/// Default collection interval (10 seconds).
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Default bound on a manual flush's drain wait (2 seconds).
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound for `interval` and `flush_timeout` (one day).
pub const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

fn default_interval() -> Duration {
    DEFAULT_INTERVAL
}

fn default_flush_timeout() -> Duration {
    DEFAULT_FLUSH_TIMEOUT
}

fn default_plugin_dir() -> PathBuf {
    PathBuf::from("plugins")
}

fn default_types_db() -> PathBuf {
    PathBuf::from("configs/types.db")
}

// =============================================================================
// Plugin Configuration
// =============================================================================

/// One `plugins:` entry. Plugins load in file order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,

    /// Expose the library's symbols to libraries loaded later.
    #[serde(default)]
    pub global: bool,

    /// Options handed to the module's `config` capability, in file order.
    #[serde(default)]
    pub options: serde_yaml::Mapping,
}

impl PluginConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Builder helper for an option.
    pub fn with_option(mut self, key: &str, value: impl Into<serde_yaml::Value>) -> Self {
        self.options
            .insert(serde_yaml::Value::String(key.to_string()), value.into());
        self
    }

    /// Options as ordered `(key, value)` strings with env vars expanded.
    pub fn option_pairs(&self) -> Result<Vec<(String, String)>, ConfigError> {
        option_pairs(&self.options)
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Working directory the daemon changes into at startup.
    #[serde(default)]
    pub base_dir: Option<PathBuf>,

    /// Module directory: module `N` lives at `<plugin_dir>/N/N.<ext>`.
    #[serde(default = "default_plugin_dir")]
    pub plugin_dir: PathBuf,

    /// Types database path.
    #[serde(default = "default_types_db")]
    pub types_db: PathBuf,

    /// Collection interval (default: 10s).
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Bound on the drain wait of a manual flush (default: 2s).
    #[serde(default = "default_flush_timeout", with = "humantime_serde")]
    pub flush_timeout: Duration,

    /// JSON file re-read on a reload trigger.
    #[serde(default)]
    pub user_config: Option<PathBuf>,

    /// Free-form global options.
    #[serde(default)]
    pub options: serde_yaml::Mapping,

    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            plugin_dir: default_plugin_dir(),
            types_db: default_types_db(),
            interval: DEFAULT_INTERVAL,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            user_config: None,
            options: serde_yaml::Mapping::new(),
            plugins: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// Relative paths in the file are resolved against the current directory
    /// at load time, so a later change into `base_dir` does not move them.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        config.plugin_dir = std::path::absolute(&config.plugin_dir)?;
        config.types_db = std::path::absolute(&config.types_db)?;
        if let Some(user) = config.user_config.take() {
            config.user_config = Some(std::path::absolute(user)?);
        }
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "interval must be non-zero".to_string(),
            ));
        }

        if self.flush_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "flush_timeout must be non-zero".to_string(),
            ));
        }

        for (field, value) in [("interval", self.interval), ("flush_timeout", self.flush_timeout)] {
            if value > MAX_INTERVAL {
                return Err(ConfigError::ValidationError(format!(
                    "{field} must not exceed {}s, got {}s",
                    MAX_INTERVAL.as_secs(),
                    value.as_secs()
                )));
            }
        }

        let mut seen = HashSet::new();
        for plugin in &self.plugins {
            if plugin.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "plugin name must not be empty".to_string(),
                ));
            }
            if plugin.name.contains(['/', '\\']) || plugin.name == ".." {
                return Err(ConfigError::ValidationError(format!(
                    "plugin name '{}' must not contain path separators",
                    plugin.name
                )));
            }
            if !seen.insert(plugin.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate plugin '{}'",
                    plugin.name
                )));
            }
            plugin.option_pairs()?;
        }

        option_pairs(&self.options)?;
        Ok(())
    }
}

// =============================================================================
// Config Source
// =============================================================================

/// What the core asks of its configuration.
pub trait ConfigSource: Send + Sync {
    /// Value of a global option, or an empty string if unset.
    fn global_option(&self, key: &str) -> String;

    fn default_interval(&self) -> Duration;

    fn data_set(&self, type_name: &str) -> Option<Arc<DataSet>>;
}

/// Validated configuration together with its parsed types database.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub app: AppConfig,
    pub types: Arc<TypesDb>,
}

impl LoadedConfig {
    /// Load the YAML file and the types database it points to.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let app = AppConfig::load(path.as_ref())?;
        let types = TypesDb::load(&app.types_db)?;
        tracing::info!(
            path = %path.as_ref().display(),
            plugins = app.plugins.len(),
            interval = ?app.interval,
            "Configuration loaded"
        );
        Ok(Self::new(app, types))
    }

    pub fn new(app: AppConfig, types: TypesDb) -> Self {
        Self {
            app,
            types: Arc::new(types),
        }
    }

    /// The types database as the dispatcher's schema lookup.
    pub fn schema(&self) -> Arc<dyn SchemaLookup> {
        self.types.clone()
    }
}

impl ConfigSource for LoadedConfig {
    fn global_option(&self, key: &str) -> String {
        let app = &self.app;
        match key {
            "BaseDir" => app
                .base_dir
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            "PluginDir" => app.plugin_dir.display().to_string(),
            "TypesDB" => app.types_db.display().to_string(),
            "Interval" => app.interval.as_secs_f64().to_string(),
            "Timeout" => app.flush_timeout.as_secs_f64().to_string(),
            other => app
                .options
                .get(other)
                .and_then(|v| super::validation::option_to_string(other, v).ok())
                .unwrap_or_default(),
        }
    }

    fn default_interval(&self) -> Duration {
        self.app.interval
    }

    fn data_set(&self, type_name: &str) -> Option<Arc<DataSet>> {
        self.types.get(type_name)
    }
}
