//! Plugin service: the fan-out façade over the registry and the dispatcher.
//!
//! Fan-out visits modules in load order. The name list is copied under the
//! registry lock, then each instance is resolved individually, so a module
//! unloaded mid-fan-out is skipped rather than observed half torn down.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::dispatcher::{DispatchError, Dispatcher, SampleSink, Submitter};
use crate::plugin::module::{Capability, Module, ModuleError, ModuleResult, ReadContext};
use crate::plugin::registry::{PluginRegistry, RegistryError};
use crate::types::{CacheEvent, DataSet, DsType, MetricDataPoint, Notification, Sample, SchemaLookup};

/// Errors surfaced by the plugin service.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// A module's init failed; later modules were not initialized.
    #[error("init of module '{plugin}' failed: {source}")]
    Init {
        plugin: String,
        #[source]
        source: ModuleError,
    },

    /// A module rejected a configuration option.
    #[error("module '{plugin}' rejected option '{key}': {source}")]
    Config {
        plugin: String,
        key: String,
        #[source]
        source: ModuleError,
    },

    /// One or more modules failed during a fan-out that visits every module.
    #[error("{operation} failed for module(s): {}", .failed.join(", "))]
    FanOut {
        operation: Capability,
        failed: Vec<String>,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

// =============================================================================
// Fan-out
// =============================================================================

/// Invoke `call` on every loaded module in load order. `call` returns `None`
/// for modules lacking the capability. Returns the names that failed.
fn fan_out<F>(registry: &PluginRegistry, operation: Capability, mut call: F) -> Vec<String>
where
    F: FnMut(&dyn Module) -> Option<ModuleResult>,
{
    let mut failed = Vec::new();
    for name in registry.list_loaded() {
        let Some(module) = registry.lookup(&name) else {
            continue;
        };
        if let Some(Err(e)) = call(module.as_ref()) {
            tracing::error!(plugin = %name, operation = %operation, error = %e, "Module call failed");
            failed.push(name);
        }
    }
    failed
}

fn aggregate(operation: Capability, failed: Vec<String>) -> Result<(), ServiceError> {
    if failed.is_empty() {
        Ok(())
    } else {
        Err(ServiceError::FanOut { operation, failed })
    }
}

/// Write fan-out handed to the dispatcher worker.
struct WriteFanOut {
    registry: Arc<PluginRegistry>,
}

impl WriteFanOut {
    fn deliver(&self, data_set: &DataSet, sample: &Sample) -> Vec<String> {
        fan_out(&self.registry, Capability::Write, |m| {
            m.as_store().map(|s| s.write(data_set, sample))
        })
    }
}

impl SampleSink for WriteFanOut {
    fn write(&self, data_set: &DataSet, sample: &Sample) {
        self.deliver(data_set, sample);
    }
}

// =============================================================================
// Service
// =============================================================================

/// The only component that talks to modules.
pub struct PluginService {
    registry: Arc<PluginRegistry>,
    writer: Arc<WriteFanOut>,
    dispatcher: Dispatcher,
    interval: Duration,
}

impl std::fmt::Debug for PluginService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginService")
            .field("registry", &self.registry)
            .field("dispatcher", &self.dispatcher)
            .field("interval", &self.interval)
            .finish()
    }
}

impl PluginService {
    /// Build the service and spawn its dispatcher. `interval` is handed to
    /// collectors through their read context.
    pub fn new(
        registry: Arc<PluginRegistry>,
        schema: Arc<dyn SchemaLookup>,
        interval: Duration,
    ) -> Result<Self, ServiceError> {
        let writer = Arc::new(WriteFanOut {
            registry: Arc::clone(&registry),
        });
        let dispatcher = Dispatcher::spawn(schema, writer.clone())?;
        Ok(Self {
            registry,
            writer,
            dispatcher,
            interval,
        })
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    // =========================================================================
    // Registry passthrough
    // =========================================================================

    pub fn load(&self, name: &str, expose_global_symbols: bool) -> Result<(), ServiceError> {
        Ok(self.registry.load(name, expose_global_symbols)?)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.registry.is_loaded(name)
    }

    /// Hand one option to module `name`. Modules without the config
    /// capability ignore options with a warning.
    pub fn configure(&self, name: &str, key: &str, value: &str) -> Result<(), ServiceError> {
        let module = self
            .registry
            .lookup(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let Some(configurable) = module.as_config() else {
            tracing::warn!(plugin = %name, key = %key, "Module takes no options, ignoring");
            return Ok(());
        };
        configurable
            .config(key, value)
            .map_err(|source| ServiceError::Config {
                plugin: name.to_string(),
                key: key.to_string(),
                source,
            })
    }

    // =========================================================================
    // Lifecycle fan-out
    // =========================================================================

    /// Initialize modules in load order, stopping at the first failure.
    pub fn init_all(&self) -> Result<(), ServiceError> {
        for name in self.registry.list_loaded() {
            let Some(module) = self.registry.lookup(&name) else {
                continue;
            };
            let Some(init) = module.as_init() else {
                continue;
            };
            tracing::debug!(plugin = %name, "Initializing module");
            if let Err(source) = init.init() {
                tracing::error!(plugin = %name, error = %source, "Module init failed");
                return Err(ServiceError::Init {
                    plugin: name,
                    source,
                });
            }
        }
        Ok(())
    }

    /// Run every collector once on the calling thread. A failing collector
    /// does not stop the others.
    pub fn read_all_once(&self) -> Result<(), ServiceError> {
        let submitter = self.dispatcher.submitter();
        let ctx = ReadContext::new(&submitter, self.interval);
        let failed = fan_out(&self.registry, Capability::Read, |m| {
            m.as_collect().map(|c| c.read(&ctx))
        });
        aggregate(Capability::Read, failed)
    }

    /// Per-tick read. Each failing module is logged by the fan-out; the
    /// aggregate status is returned for callers that track it.
    pub fn read_all(&self) -> Result<(), ServiceError> {
        let result = self.read_all_once();
        if let Err(e) = &result {
            tracing::debug!(error = %e, "Read tick finished with failures");
        }
        result
    }

    /// Write fan-out. Normally invoked only by the dispatcher worker.
    pub fn write(&self, data_set: &DataSet, sample: &Sample) -> Result<(), ServiceError> {
        aggregate(Capability::Write, self.writer.deliver(data_set, sample))
    }

    /// Flush one module by name, or every module when `plugin` is `None`.
    pub fn flush(&self, plugin: Option<&str>) -> Result<(), ServiceError> {
        let mut failed = Vec::new();
        for name in self.registry.list_loaded() {
            if plugin.is_some_and(|p| p != name) {
                continue;
            }
            let Some(module) = self.registry.lookup(&name) else {
                continue;
            };
            if let Some(Err(e)) = module.as_flush().map(|f| f.flush()) {
                tracing::error!(plugin = %name, error = %e, "Module flush failed");
                failed.push(name);
            }
        }
        aggregate(Capability::Flush, failed)
    }

    pub fn flush_all(&self) -> Result<(), ServiceError> {
        self.flush(None)
    }

    pub fn dispatch_missing(&self, sample: &Sample) {
        fan_out(&self.registry, Capability::Notify, |m| {
            m.as_notify().map(|n| n.missing(sample))
        });
    }

    pub fn dispatch_notification(&self, notification: &Notification) {
        fan_out(&self.registry, Capability::Notify, |m| {
            m.as_notify().map(|n| n.notification(notification))
        });
    }

    pub fn dispatch_cache_event(&self, event: &CacheEvent) {
        fan_out(&self.registry, Capability::Notify, |m| {
            m.as_notify().map(|n| n.cache_event(event))
        });
    }

    /// Shut down and unload every module, then stop the dispatcher. Samples
    /// still queued at that point reach no module.
    pub fn shutdown_all(&self) -> Result<(), ServiceError> {
        let mut failed = Vec::new();
        for name in self.registry.list_loaded() {
            if let Some(module) = self.registry.lookup(&name)
                && let Some(Err(e)) = module.as_shutdown().map(|s| s.shutdown())
            {
                tracing::error!(plugin = %name, error = %e, "Module shutdown failed");
                failed.push(name.clone());
            }
            if let Err(e) = self.registry.unload(&name) {
                tracing::warn!(plugin = %name, error = %e, "Module unload failed");
            }
        }
        self.dispatcher.stop();
        tracing::info!("All modules shut down");
        aggregate(Capability::Shutdown, failed)
    }

    // =========================================================================
    // Producer API
    // =========================================================================

    pub fn submitter(&self) -> Submitter {
        self.dispatcher.submitter()
    }

    pub fn submit(&self, sample: &Sample) -> Result<(), ServiceError> {
        Ok(self.dispatcher.submit(sample)?)
    }

    pub fn submit_derived(
        &self,
        template: &Sample,
        percent: bool,
        kind: DsType,
        points: &[MetricDataPoint],
    ) -> Result<usize, ServiceError> {
        Ok(self
            .dispatcher
            .submit_derived(template, percent, kind, points)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::module::{Collect, Configure, Flush, Init, Notify, Shutdown, Store};
    use crate::plugin::provider::StaticProvider;
    use crate::types::{DataSource, Severity, Value};
    use parking_lot::Mutex;

    // =========================================================================
    // Fixtures
    // =========================================================================

    type Journal = Arc<Mutex<Vec<String>>>;

    /// Records every call as `"<name>.<op>"` and fails the ops listed in `fail`.
    struct Probe {
        name: &'static str,
        journal: Journal,
        fail: &'static [&'static str],
    }

    impl Probe {
        fn record(&self, op: &str) -> ModuleResult {
            self.journal.lock().push(format!("{}.{op}", self.name));
            if self.fail.contains(&op) {
                Err(ModuleError::Status(-1))
            } else {
                Ok(())
            }
        }
    }

    impl Configure for Probe {
        fn config(&self, key: &str, _value: &str) -> ModuleResult {
            self.record(&format!("config:{key}"))
        }
    }

    impl Init for Probe {
        fn init(&self) -> ModuleResult {
            self.record("init")
        }
    }

    impl Collect for Probe {
        fn read(&self, ctx: &ReadContext<'_>) -> ModuleResult {
            self.record("read")?;
            let sample = Sample::new(self.name, "gauge").with_value(Value::Gauge(1.0));
            ctx.submit(&sample)
        }
    }

    impl Store for Probe {
        fn write(&self, _: &DataSet, sample: &Sample) -> ModuleResult {
            self.record(&format!("write:{}", sample.plugin))
        }
    }

    impl Flush for Probe {
        fn flush(&self) -> ModuleResult {
            self.record("flush")
        }
    }

    impl Shutdown for Probe {
        fn shutdown(&self) -> ModuleResult {
            self.record("shutdown")
        }
    }

    impl Notify for Probe {
        fn missing(&self, _: &Sample) -> ModuleResult {
            self.record("missing")
        }

        fn notification(&self, _: &Notification) -> ModuleResult {
            self.record("notification")
        }

        fn cache_event(&self, _: &CacheEvent) -> ModuleResult {
            self.record("cache_event")
        }
    }

    impl Module for Probe {
        fn as_config(&self) -> Option<&dyn Configure> {
            Some(self)
        }
        fn as_init(&self) -> Option<&dyn Init> {
            Some(self)
        }
        fn as_collect(&self) -> Option<&dyn Collect> {
            Some(self)
        }
        fn as_store(&self) -> Option<&dyn Store> {
            Some(self)
        }
        fn as_flush(&self) -> Option<&dyn Flush> {
            Some(self)
        }
        fn as_shutdown(&self) -> Option<&dyn Shutdown> {
            Some(self)
        }
        fn as_notify(&self) -> Option<&dyn Notify> {
            Some(self)
        }
    }

    /// A module with no capabilities at all.
    struct Inert;
    impl Module for Inert {}

    struct Schemas;

    impl SchemaLookup for Schemas {
        fn data_set(&self, type_name: &str) -> Option<Arc<DataSet>> {
            (type_name == "gauge").then(|| {
                Arc::new(DataSet::new(
                    "gauge",
                    vec![DataSource::new("value", DsType::Gauge, f64::NEG_INFINITY, f64::INFINITY)],
                ))
            })
        }
    }

    fn service(modules: &[(&'static str, &'static [&'static str])]) -> (PluginService, Journal) {
        let journal: Journal = Arc::default();
        let mut provider = StaticProvider::new();
        for &(name, fail) in modules {
            let journal = Arc::clone(&journal);
            provider.register(name, move || {
                Some(Arc::new(Probe {
                    name,
                    journal: Arc::clone(&journal),
                    fail,
                }) as Arc<dyn Module>)
            });
        }
        provider.register("inert", || Some(Arc::new(Inert) as Arc<dyn Module>));

        let registry = Arc::new(PluginRegistry::new(Arc::new(provider)));
        for &(name, _) in modules {
            registry.load(name, false).unwrap();
        }
        let service =
            PluginService::new(registry, Arc::new(Schemas), Duration::from_secs(10)).unwrap();
        (service, journal)
    }

    fn calls(journal: &Journal, op: &str) -> Vec<String> {
        journal
            .lock()
            .iter()
            .filter(|c| c.ends_with(&format!(".{op}")))
            .cloned()
            .collect()
    }

    const WAIT: Duration = Duration::from_secs(5);

    // =========================================================================
    // Tests
    // =========================================================================

    #[test]
    fn test_init_all_fails_fast() {
        let (service, journal) = service(&[("a", &["init"]), ("b", &[]), ("c", &[])]);

        let err = service.init_all().unwrap_err();
        assert!(matches!(err, ServiceError::Init { ref plugin, .. } if plugin == "a"));
        assert_eq!(calls(&journal, "init"), vec!["a.init"]);
    }

    #[test]
    fn test_init_all_in_load_order() {
        let (service, journal) = service(&[("c", &[]), ("a", &[]), ("b", &[])]);
        service.init_all().unwrap();
        assert_eq!(calls(&journal, "init"), vec!["c.init", "a.init", "b.init"]);
    }

    #[test]
    fn test_read_all_visits_every_module_despite_failure() {
        let (service, journal) = service(&[("a", &[]), ("b", &["read"]), ("c", &[])]);

        let err = service.read_all_once().unwrap_err();
        match err {
            ServiceError::FanOut { operation, failed } => {
                assert_eq!(operation, Capability::Read);
                assert_eq!(failed, vec!["b"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(calls(&journal, "read"), vec!["a.read", "b.read", "c.read"]);
    }

    #[test]
    fn test_read_all_reports_aggregate_status() {
        let (service, journal) = service(&[("a", &["read"]), ("b", &[])]);

        let err = service.read_all().unwrap_err();
        assert!(matches!(err, ServiceError::FanOut { ref failed, .. } if failed == &["a"]));
        assert_eq!(calls(&journal, "read"), vec!["a.read", "b.read"]);
    }

    #[test]
    fn test_read_submissions_reach_every_writer() {
        let (service, journal) = service(&[("a", &[]), ("b", &[])]);
        service.read_all().unwrap();
        service.dispatcher().flush_all(WAIT, None).unwrap();

        let writes: Vec<String> = journal
            .lock()
            .iter()
            .filter(|c| c.contains(".write:"))
            .cloned()
            .collect();
        assert_eq!(writes, vec!["a.write:a", "b.write:a", "a.write:b", "b.write:b"]);
    }

    #[test]
    fn test_write_failure_is_aggregated() {
        let (service, _) = service(&[("a", &["write:x"]), ("b", &[])]);
        let ds = Schemas.data_set("gauge").unwrap();
        let sample = Sample::new("x", "gauge").with_value(Value::Gauge(1.0));

        let err = service.write(&ds, &sample).unwrap_err();
        assert!(matches!(err, ServiceError::FanOut { ref failed, .. } if failed == &["a"]));
    }

    #[test]
    fn test_flush_by_name_and_all() {
        let (service, journal) = service(&[("a", &[]), ("b", &["flush"])]);

        service.flush(Some("a")).unwrap();
        assert_eq!(calls(&journal, "flush"), vec!["a.flush"]);

        assert!(service.flush_all().is_err());
        assert_eq!(calls(&journal, "flush"), vec!["a.flush", "a.flush", "b.flush"]);
    }

    #[test]
    fn test_configure_routes_to_module() {
        let (service, journal) = service(&[("a", &["config:Bad"])]);
        service.configure("a", "DataDir", "/tmp").unwrap();
        assert!(journal.lock().contains(&"a.config:DataDir".to_string()));

        assert!(matches!(
            service.configure("a", "Bad", "1").unwrap_err(),
            ServiceError::Config { .. }
        ));
        assert!(matches!(
            service.configure("missing", "k", "v").unwrap_err(),
            ServiceError::Registry(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_capability_absent_is_skipped() {
        let (service, journal) = service(&[("a", &[])]);
        service.load("inert", false).unwrap();

        service.configure("inert", "Key", "v").unwrap();
        service.init_all().unwrap();
        service.read_all_once().unwrap();
        assert_eq!(calls(&journal, "init"), vec!["a.init"]);
    }

    #[test]
    fn test_auxiliary_broadcasts() {
        let (service, journal) = service(&[("a", &[]), ("b", &["missing"])]);
        let sample = Sample::new("x", "gauge").with_value(Value::Gauge(1.0));

        service.dispatch_missing(&sample);
        service.dispatch_notification(&Notification::new(Severity::Warning, "disk almost full"));
        service.dispatch_cache_event(&CacheEvent {
            kind: crate::types::CacheEventKind::ValueNew,
            name: sample.identifier(),
            sample: sample.clone(),
        });

        assert_eq!(calls(&journal, "missing"), vec!["a.missing", "b.missing"]);
        assert_eq!(calls(&journal, "notification").len(), 2);
        assert_eq!(calls(&journal, "cache_event").len(), 2);
    }

    #[test]
    fn test_shutdown_all_unloads_and_stops_dispatcher() {
        let (service, journal) = service(&[("a", &["shutdown"]), ("b", &[])]);

        assert!(service.shutdown_all().is_err());
        assert_eq!(calls(&journal, "shutdown"), vec!["a.shutdown", "b.shutdown"]);
        assert!(service.registry().is_empty());
        assert_eq!(
            service.dispatcher().state(),
            crate::dispatcher::DispatcherState::Stopped
        );
        assert!(matches!(
            service.submit(&Sample::new("x", "gauge").with_value(Value::Gauge(1.0))),
            Err(ServiceError::Dispatch(DispatchError::Stopped))
        ));
    }

    #[test]
    fn test_submit_derived_passthrough() {
        let (service, _) = service(&[]);
        let points = [
            MetricDataPoint::new("user", 25.0),
            MetricDataPoint::new("system", 75.0),
        ];

        let failed = service
            .submit_derived(&Sample::new("cpu", "cpu"), true, DsType::Gauge, &points)
            .unwrap();
        assert_eq!(failed, 0);
        service.dispatcher().flush_all(WAIT, None).unwrap();
        assert_eq!(service.dispatcher().stats().submitted, 2);
    }
}
