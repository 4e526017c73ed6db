//! telemetryd - Telemetry Collection Daemon
//!
//! This crate provides the core of a plugin-driven collection daemon. It can
//! be embedded as a library or run through the `telemetryd` executable.
//!
//! # Architecture
//!
//! - **Plugin Registry**: loads modules by name, one live instance per name
//! - **Plugin Service**: fans lifecycle and data operations out to modules
//! - **Dispatcher**: single-worker FIFO between collectors and writers
//! - **Scheduler**: drift-correcting collection loop
//! - **Daemon**: composition root and process state machine
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use telemetryd::{Daemon, LoadedConfig, RunMode, modules::builtin_provider};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LoadedConfig::load("configs/config.yaml")?;
//! let daemon = Daemon::configure(&config, Arc::new(builtin_provider()))?;
//! daemon.run(RunMode::ReadOnce)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod daemon;
pub mod dispatcher;
pub mod logging;
pub mod modules;
pub mod plugin;
pub mod scheduler;
pub mod types;

pub use config::{AppConfig, ConfigError, ConfigSource, LoadedConfig, TypesDb, UserConfig};
pub use daemon::{Daemon, DaemonError, DaemonHandle, DaemonState, RunMode};
pub use dispatcher::{DispatchError, DispatchStats, Dispatcher, Submitter};
pub use plugin::{
    ChainProvider, DylibProvider, Module, ModuleError, ModuleProvider, PluginRegistry,
    PluginService, ServiceError, StaticProvider,
};
pub use scheduler::Scheduler;
pub use types::{DataSet, DataSource, DsType, MetricDataPoint, Sample, Value};
