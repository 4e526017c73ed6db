//! Configuration module for telemetryd.
//!
//! Provides configuration loading and validation for:
//! - Daemon settings (base dir, plugin dir, interval, flush timeout)
//! - Plugin list with per-plugin options, in load order
//! - Types database (schemas looked up by type name)
//! - Hot-reloadable user configuration (log levels)

mod app;
mod types_db;
mod user;
mod validation;

pub use app::{
    AppConfig, ConfigSource, DEFAULT_FLUSH_TIMEOUT, DEFAULT_INTERVAL, LoadedConfig, PluginConfig,
};
pub use types_db::TypesDb;
pub use user::{LogControl, LogLevel, UserConfig};
pub use validation::{ConfigError, expand_env_vars, option_pairs};
