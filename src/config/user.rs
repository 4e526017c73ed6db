//! Hot-reloadable user configuration.
//!
//! A small JSON document re-read on demand (SIGUSR2) to adjust log levels
//! without restarting the daemon:
//!
//! ```json
//! {
//!   "log_level": "INFO",
//!   "modules": { "telemetryd::dispatcher": { "log_level": "DEBUG" } },
//!   "system": { "debug_mode": false }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use strum_macros::{AsRefStr, Display, EnumString};

use super::validation::ConfigError;

/// Runtime control over the active log filter.
pub trait LogControl: Send + Sync {
    /// Replace the active filter with `directives` (`EnvFilter` syntax).
    fn set_filter(&self, directives: &str) -> Result<(), ConfigError>;
}

/// Log level names accepted in the user configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display, AsRefStr)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    #[strum(serialize = "WARNING", serialize = "WARN")]
    Warning,
    Error,
}

impl LogLevel {
    /// Unknown names fall back to `INFO`.
    fn parse_lenient(s: &str) -> Self {
        Self::from_str(s).unwrap_or_else(|_| {
            tracing::warn!(level = %s, "Unknown log level, using INFO");
            Self::Info
        })
    }

    fn directive(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModuleLogConfig {
    #[serde(default)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemConfig {
    /// Force `debug` as the global level.
    #[serde(default)]
    pub debug_mode: bool,
}

/// Parsed user configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserConfig {
    #[serde(default)]
    pub log_level: Option<String>,

    /// Per-target overrides, keyed by tracing target (module path).
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleLogConfig>,

    #[serde(default)]
    pub system: SystemConfig,
}

impl UserConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Translate into `EnvFilter` directives. Targets that are not valid
    /// module paths are skipped.
    pub fn directives(&self) -> String {
        static TARGET_REGEX: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
        let target_regex = TARGET_REGEX.get_or_init(|| {
            regex::Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(::[A-Za-z_][A-Za-z0-9_]*)*$")
                .expect("failed to compile target regex")
        });

        let global = if self.system.debug_mode {
            LogLevel::Debug
        } else {
            self.log_level
                .as_deref()
                .map(LogLevel::parse_lenient)
                .unwrap_or_default()
        };

        let mut directives = vec![global.directive().to_string()];
        for (target, module) in &self.modules {
            let Some(level) = module.log_level.as_deref() else {
                continue;
            };
            if !target_regex.is_match(target) {
                tracing::warn!(target_name = %target, "Invalid log target in user config, skipping");
                continue;
            }
            let level = LogLevel::parse_lenient(level);
            directives.push(format!("{target}={}", level.directive()));
        }
        directives.join(",")
    }

    /// Push the derived filter to `log`.
    pub fn apply(&self, log: &dyn LogControl) -> Result<(), ConfigError> {
        let directives = self.directives();
        log.set_filter(&directives)?;
        tracing::info!(filter = %directives, "User configuration applied");
        Ok(())
    }

    /// Load `path` and apply it.
    pub fn load_and_apply(path: impl AsRef<Path>, log: &dyn LogControl) -> Result<(), ConfigError> {
        Self::load(path)?.apply(log)
    }
}
