//! Module capability interface.
//!
//! A module advertises each capability it implements by returning `Some` from
//! the matching accessor. Callers check presence instead of invoking inert
//! defaults, so a module that cannot write is simply skipped by the write
//! fan-out.

use std::time::Duration;

use strum_macros::{AsRefStr, Display};
use thiserror::Error;

use crate::dispatcher::{DispatchError, Submitter};
use crate::types::{CacheEvent, DataSet, DsType, MetricDataPoint, Notification, Sample};

/// Errors reported by a module capability call.
#[derive(Debug, Error)]
pub enum ModuleError {
    /// Module-specific non-zero status code.
    #[error("module returned status {0}")]
    Status(i32),

    /// Failure with a human-readable reason.
    #[error("{0}")]
    Failed(String),

    /// Unsupported or malformed configuration option.
    #[error("invalid option '{key}': {reason}")]
    InvalidOption { key: String, reason: String },

    /// I/O error inside the module.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Submitting a sample to the pipeline failed.
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

pub type ModuleResult = Result<(), ModuleError>;

/// Capability names, in the order the daemon exercises them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Capability {
    Config,
    Init,
    Read,
    Write,
    Flush,
    Shutdown,
    Notify,
}

// =============================================================================
// Capabilities
// =============================================================================

pub trait Configure: Send + Sync {
    /// Apply one `key = value` option from the plugin's configuration block.
    fn config(&self, key: &str, value: &str) -> ModuleResult;
}

pub trait Init: Send + Sync {
    fn init(&self) -> ModuleResult;
}

/// Collector capability. Runs on the scheduler thread once per tick.
pub trait Collect: Send + Sync {
    fn read(&self, ctx: &ReadContext<'_>) -> ModuleResult;
}

/// Writer capability. Runs on the dispatcher worker, one sample at a time.
pub trait Store: Send + Sync {
    fn write(&self, data_set: &DataSet, sample: &Sample) -> ModuleResult;
}

pub trait Flush: Send + Sync {
    fn flush(&self) -> ModuleResult;
}

pub trait Shutdown: Send + Sync {
    fn shutdown(&self) -> ModuleResult;
}

/// Listener for auxiliary broadcasts.
pub trait Notify: Send + Sync {
    fn missing(&self, sample: &Sample) -> ModuleResult;
    fn notification(&self, notification: &Notification) -> ModuleResult;
    fn cache_event(&self, event: &CacheEvent) -> ModuleResult;
}

/// A loaded module. Every accessor defaults to "capability absent".
pub trait Module: Send + Sync {
    fn as_config(&self) -> Option<&dyn Configure> {
        None
    }

    fn as_init(&self) -> Option<&dyn Init> {
        None
    }

    fn as_collect(&self) -> Option<&dyn Collect> {
        None
    }

    fn as_store(&self) -> Option<&dyn Store> {
        None
    }

    fn as_flush(&self) -> Option<&dyn Flush> {
        None
    }

    fn as_shutdown(&self) -> Option<&dyn Shutdown> {
        None
    }

    fn as_notify(&self) -> Option<&dyn Notify> {
        None
    }
}

/// Capabilities `module` advertises.
pub fn capabilities(module: &dyn Module) -> Vec<Capability> {
    let present = [
        (Capability::Config, module.as_config().is_some()),
        (Capability::Init, module.as_init().is_some()),
        (Capability::Read, module.as_collect().is_some()),
        (Capability::Write, module.as_store().is_some()),
        (Capability::Flush, module.as_flush().is_some()),
        (Capability::Shutdown, module.as_shutdown().is_some()),
        (Capability::Notify, module.as_notify().is_some()),
    ];
    present
        .into_iter()
        .filter_map(|(cap, has)| has.then_some(cap))
        .collect()
}

// =============================================================================
// Read context
// =============================================================================

/// What a collector sees during one read: the submit API and the tick interval.
pub struct ReadContext<'a> {
    submitter: &'a Submitter,
    interval: Duration,
}

impl<'a> ReadContext<'a> {
    pub fn new(submitter: &'a Submitter, interval: Duration) -> Self {
        Self {
            submitter,
            interval,
        }
    }

    /// Configured collection interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Submit a sample; a zero interval is replaced by the tick interval.
    pub fn submit(&self, sample: &Sample) -> ModuleResult {
        if sample.interval.is_zero() {
            let mut owned = sample.clone();
            owned.interval = self.interval;
            self.submitter.submit(&owned)?;
        } else {
            self.submitter.submit(sample)?;
        }
        Ok(())
    }

    /// Derive one sample per point. Returns the number of points that failed.
    pub fn submit_derived(
        &self,
        template: &Sample,
        percent: bool,
        kind: DsType,
        points: &[MetricDataPoint],
    ) -> Result<usize, ModuleError> {
        let failed = if template.interval.is_zero() {
            let mut owned = template.clone();
            owned.interval = self.interval;
            self.submitter.submit_derived(&owned, percent, kind, points)?
        } else {
            self.submitter
                .submit_derived(template, percent, kind, points)?
        };
        Ok(failed)
    }

    pub fn submitter(&self) -> &Submitter {
        self.submitter
    }
}
