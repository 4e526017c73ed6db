//! Built-in modules, served in-process through a [`StaticProvider`].
//!
//! - [`csv`]: writer that appends samples to CSV files or streams them
//! - [`uptime`]: system uptime collector
//! - [`load`]: system load average collector
//!
//! Out-of-tree modules are shared libraries exporting the symbols generated
//! by [`declare_module!`](crate::declare_module).

pub mod csv;
pub mod load;
pub mod uptime;

use std::sync::Arc;

use crate::plugin::{Module, ModuleError, StaticProvider};

/// Provider for every built-in module, keyed by module name.
pub fn builtin_provider() -> StaticProvider {
    StaticProvider::new()
        .with("csv", || Some(Arc::new(csv::CsvWriter::default()) as Arc<dyn Module>))
        .with("uptime", || Some(Arc::new(uptime::Uptime::default()) as Arc<dyn Module>))
        .with("load", || Some(Arc::new(load::Load::default()) as Arc<dyn Module>))
}

/// Parse a boolean option value (`true`/`false`, `yes`/`no`, `on`/`off`, `1`/`0`).
pub(crate) fn parse_bool(key: &str, value: &str) -> Result<bool, ModuleError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(ModuleError::InvalidOption {
            key: key.to_string(),
            reason: format!("expected a boolean, got '{value}'"),
        }),
    }
}
