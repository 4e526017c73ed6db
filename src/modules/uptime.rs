//! System uptime collector.
//!
//! Reads seconds since boot from `/proc/uptime` and submits one `uptime`
//! gauge per tick.

use std::path::{Path, PathBuf};

use crate::plugin::{Collect, Init, Module, ModuleError, ModuleResult, ReadContext};
use crate::types::{Sample, Value};

const PROC_UPTIME: &str = "/proc/uptime";

/// Uptime collector.
#[derive(Debug, Clone)]
pub struct Uptime {
    source: PathBuf,
}

impl Default for Uptime {
    fn default() -> Self {
        Self::with_source(PROC_UPTIME)
    }
}

impl Uptime {
    /// Collector reading an alternative `/proc/uptime`-formatted file.
    pub fn with_source(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
        }
    }

    fn seconds(&self) -> Result<f64, ModuleError> {
        parse_uptime(&std::fs::read_to_string(&self.source)?, &self.source)
    }
}

fn parse_uptime(content: &str, source: &Path) -> Result<f64, ModuleError> {
    content
        .split_whitespace()
        .next()
        .and_then(|field| field.parse::<f64>().ok())
        .ok_or_else(|| ModuleError::Failed(format!("malformed uptime in {}", source.display())))
}

impl Init for Uptime {
    fn init(&self) -> ModuleResult {
        let seconds = self.seconds()?;
        tracing::debug!(source = %self.source.display(), seconds, "Uptime source readable");
        Ok(())
    }
}

impl Collect for Uptime {
    fn read(&self, ctx: &ReadContext<'_>) -> ModuleResult {
        let seconds = self.seconds()?;
        ctx.submit(&Sample::new("uptime", "uptime").with_value(Value::Gauge(seconds.floor())))
    }
}

impl Module for Uptime {
    fn as_init(&self) -> Option<&dyn Init> {
        Some(self)
    }

    fn as_collect(&self) -> Option<&dyn Collect> {
        Some(self)
    }
}
