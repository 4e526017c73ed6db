//! Tracing setup with a filter that can be swapped at runtime.

use std::sync::Arc;

use tracing_subscriber::{
    EnvFilter, Registry, fmt, layer::SubscriberExt, reload, util::SubscriberInitExt,
};

use crate::config::{ConfigError, LogControl};

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "info,telemetryd=info";

/// [`LogControl`] backed by a `tracing_subscriber` reload handle.
#[derive(Debug, Clone)]
pub struct ReloadControl {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl ReloadControl {
    pub fn new(handle: reload::Handle<EnvFilter, Registry>) -> Self {
        Self { handle }
    }
}

impl LogControl for ReloadControl {
    fn set_filter(&self, directives: &str) -> Result<(), ConfigError> {
        let filter = EnvFilter::try_new(directives).map_err(|e| {
            ConfigError::ValidationError(format!("invalid log filter '{directives}': {e}"))
        })?;
        self.handle
            .reload(filter)
            .map_err(|e| ConfigError::ValidationError(format!("failed to reload log filter: {e}")))
    }
}

/// Install the global subscriber. Call once, before anything logs.
pub fn init() -> Arc<dyn LogControl> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    Arc::new(ReloadControl::new(handle))
}
