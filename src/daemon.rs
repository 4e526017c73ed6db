//! Daemon composition root.
//!
//! Builds registry → service (+ dispatcher) → scheduler explicitly from one
//! configuration, then drives the process state machine:
//!
//! `Configured → Initialized → Running → Stopping → Terminated`
//!
//! The one-shot modes (`ReadOnce`, `FlushOnce`) skip `Running`.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

use crate::config::{ConfigError, ConfigSource, LoadedConfig, LogControl, UserConfig};
use crate::dispatcher::DispatchError;
use crate::plugin::{ModuleProvider, PluginRegistry, PluginService, ServiceError};
use crate::scheduler::{Clock, Scheduler, SystemClock};

/// Errors that end a daemon run.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Some plugins failed to load or rejected options.
    #[error("{failed} plugin load/config step(s) failed")]
    Configure { failed: usize },

    /// A module failed to initialize; the daemon never reached `Running`.
    #[error("plugin initialization failed: {0}")]
    Init(#[source] ServiceError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot run daemon in state {0}")]
    State(DaemonState),
}

/// Process lifecycle states. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, AsRefStr)]
pub enum DaemonState {
    Configured,
    Initialized,
    Running,
    Stopping,
    Terminated,
}

/// What `run` does after initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum RunMode {
    /// Collect every interval until stopped.
    #[default]
    Daemon,
    /// Read every collector once and exit.
    ReadOnce,
    /// Flush every module once and exit.
    FlushOnce,
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Daemon`].
pub struct DaemonBuilder<'a> {
    config: &'a LoadedConfig,
    provider: Arc<dyn ModuleProvider>,
    log: Option<Arc<dyn LogControl>>,
    clock: Arc<dyn Clock>,
    create_base_dir: bool,
}

impl<'a> DaemonBuilder<'a> {
    /// Hot-reload target for the user configuration.
    pub fn log_control(mut self, log: Arc<dyn LogControl>) -> Self {
        self.log = Some(log);
        self
    }

    /// Clock driving the collection loop.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Create `base_dir` if missing (default: true).
    pub fn create_base_dir(mut self, create: bool) -> Self {
        self.create_base_dir = create;
        self
    }

    /// Wire every component and load the configured plugins.
    ///
    /// Every load or option failure is logged; if any occurred the loaded
    /// modules are torn down and `DaemonError::Configure` is returned.
    pub fn configure(self) -> Result<Daemon, DaemonError> {
        let config = self.config;
        let app = &config.app;

        if let Some(dir) = &app.base_dir {
            if self.create_base_dir {
                std::fs::create_dir_all(dir)?;
            }
            std::env::set_current_dir(dir)?;
            tracing::info!(dir = %dir.display(), "Changed into base directory");
        }

        let interval = config.default_interval();
        let registry = Arc::new(PluginRegistry::new(self.provider));
        registry.set_directory(&app.plugin_dir);
        let service = PluginService::new(registry, config.schema(), interval)?;

        let mut failed = 0;
        for plugin in &app.plugins {
            if let Err(e) = service.load(&plugin.name, plugin.global) {
                tracing::error!(plugin = %plugin.name, error = %e, "Failed to load plugin");
                failed += 1;
                continue;
            }
            for (key, value) in plugin.option_pairs()? {
                if let Err(e) = service.configure(&plugin.name, &key, &value) {
                    tracing::error!(plugin = %plugin.name, key = %key, error = %e,
                        "Failed to configure plugin");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            if let Err(e) = service.shutdown_all() {
                tracing::warn!(error = %e, "Teardown after failed configuration reported errors");
            }
            return Err(DaemonError::Configure { failed });
        }

        let inner = Inner {
            service,
            scheduler: Scheduler::with_clock(interval, self.clock),
            state: Mutex::new(DaemonState::Configured),
            flush_timeout: app.flush_timeout,
            user_config: app.user_config.clone(),
            log: self.log,
        };
        tracing::info!(plugins = app.plugins.len(), interval = ?interval, "Daemon configured");
        Ok(Daemon {
            inner: Arc::new(inner),
        })
    }
}

// =============================================================================
// Daemon
// =============================================================================

struct Inner {
    service: PluginService,
    scheduler: Scheduler,
    state: Mutex<DaemonState>,
    flush_timeout: Duration,
    user_config: Option<PathBuf>,
    log: Option<Arc<dyn LogControl>>,
}

impl Inner {
    fn set_state(&self, next: DaemonState) {
        let mut state = self.state.lock();
        tracing::debug!(from = %*state, to = %next, "Daemon state change");
        *state = next;
    }

    /// Wait for queued samples to reach the writers, bounded by the flush timeout.
    fn drain(&self) {
        match self
            .service
            .dispatcher()
            .flush_all(self.flush_timeout, None)
        {
            Ok(()) | Err(DispatchError::Stopped) => {}
            Err(e) => tracing::warn!(error = %e, "Dispatcher drain incomplete"),
        }
    }

    /// Drain the dispatcher, then flush modules.
    fn flush(&self) -> Result<(), ServiceError> {
        self.drain();
        self.service.flush_all()
    }
}

/// The configured daemon.
pub struct Daemon {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("state", &self.state())
            .field("service", &self.inner.service)
            .field("scheduler", &self.inner.scheduler)
            .finish()
    }
}

impl Daemon {
    /// Start building a daemon from `config`, obtaining modules from `provider`.
    pub fn builder(config: &LoadedConfig, provider: Arc<dyn ModuleProvider>) -> DaemonBuilder<'_> {
        DaemonBuilder {
            config,
            provider,
            log: None,
            clock: Arc::new(SystemClock),
            create_base_dir: true,
        }
    }

    /// Shorthand for `builder(..).configure()`.
    pub fn configure(
        config: &LoadedConfig,
        provider: Arc<dyn ModuleProvider>,
    ) -> Result<Self, DaemonError> {
        Self::builder(config, provider).configure()
    }

    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn service(&self) -> &PluginService {
        &self.inner.service
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn state(&self) -> DaemonState {
        *self.inner.state.lock()
    }

    /// Initialize every module, run `mode`, then tear everything down.
    ///
    /// Init failure is fatal and returned before `Running` is reached. In
    /// `ReadOnce` and `FlushOnce` the aggregate status of the single action
    /// is returned. Read failures during `Daemon` mode are only logged.
    pub fn run(&self, mode: RunMode) -> Result<(), DaemonError> {
        let inner = &self.inner;
        let state = self.state();
        if state != DaemonState::Configured {
            return Err(DaemonError::State(state));
        }

        if let Err(e) = inner.service.init_all() {
            self.terminate(false);
            return Err(DaemonError::Init(e));
        }
        inner.set_state(DaemonState::Initialized);
        tracing::info!(mode = %mode, "Modules initialized");

        let result = match mode {
            RunMode::ReadOnce => inner.service.read_all_once(),
            RunMode::FlushOnce => inner.service.flush_all(),
            RunMode::Daemon => {
                inner.set_state(DaemonState::Running);
                inner.scheduler.run(|| {
                    // Failing modules were already logged by the fan-out.
                    let _ = inner.service.read_all();
                });
                Ok(())
            }
        };

        // In FlushOnce the flush above is the only one.
        self.terminate(mode != RunMode::FlushOnce);
        result.map_err(DaemonError::from)
    }

    /// Tear down a daemon that was configured but never run: shut down and
    /// unload every module without initializing, reading or flushing.
    pub fn shutdown(&self) -> Result<(), DaemonError> {
        let state = self.state();
        if state != DaemonState::Configured {
            return Err(DaemonError::State(state));
        }
        self.terminate(false);
        Ok(())
    }

    /// Stopping → drain (and module flush if `flush_modules`) → shutdown → Terminated.
    fn terminate(&self, flush_modules: bool) {
        let inner = &self.inner;
        inner.set_state(DaemonState::Stopping);
        if flush_modules {
            if let Err(e) = inner.flush() {
                tracing::warn!(error = %e, "Final flush reported errors");
            }
        } else {
            inner.drain();
        }
        if let Err(e) = inner.service.shutdown_all() {
            tracing::warn!(error = %e, "Shutdown reported errors");
        }
        inner.set_state(DaemonState::Terminated);
        tracing::info!("Daemon terminated");
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable control surface for asynchronous triggers.
#[derive(Clone)]
pub struct DaemonHandle {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DaemonHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonHandle")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl DaemonHandle {
    /// Ask the collection loop to exit at its next check point.
    pub fn stop(&self) {
        tracing::info!("Stop requested");
        self.inner.scheduler.stop();
    }

    pub fn state(&self) -> DaemonState {
        *self.inner.state.lock()
    }

    /// Flush on a short-lived worker thread. The returned handle may be
    /// dropped to detach it.
    pub fn trigger_flush(&self) -> std::io::Result<JoinHandle<()>> {
        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name("manual-flush".into())
            .spawn(move || {
                tracing::info!("Manual flush started");
                match inner.flush() {
                    Ok(()) => tracing::info!("Manual flush complete"),
                    Err(e) => tracing::warn!(error = %e, "Manual flush reported errors"),
                }
            })
    }

    /// Re-read and apply the user configuration on a short-lived worker thread.
    pub fn trigger_reload(&self) -> std::io::Result<JoinHandle<()>> {
        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name("config-reload".into())
            .spawn(move || {
                let Some(path) = inner.user_config.as_deref() else {
                    tracing::warn!("Reload requested but no user_config is configured");
                    return;
                };
                let Some(log) = inner.log.as_deref() else {
                    tracing::warn!("Reload requested but log control is unavailable");
                    return;
                };
                if let Err(e) = UserConfig::load_and_apply(path, log) {
                    tracing::error!(path = %path.display(), error = %e,
                        "Failed to apply user configuration");
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, PluginConfig, TypesDb};
    use crate::plugin::{
        Collect, Configure, Flush, Init, Module, ModuleError, ModuleResult, ReadContext, Shutdown,
        StaticProvider,
    };
    use crate::types::{Sample, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[derive(Default)]
    struct Counter {
        reads: AtomicUsize,
        fail_init: bool,
        fail_read: bool,
    }

    impl Init for Counter {
        fn init(&self) -> ModuleResult {
            if self.fail_init {
                Err(ModuleError::Failed("no device".into()))
            } else {
                Ok(())
            }
        }
    }

    impl Collect for Counter {
        fn read(&self, ctx: &ReadContext<'_>) -> ModuleResult {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.fail_read {
                return Err(ModuleError::Status(5));
            }
            ctx.submit(&Sample::new("counter", "gauge").with_value(Value::Gauge(1.0)))
        }
    }

    impl Configure for Counter {
        fn config(&self, key: &str, _: &str) -> ModuleResult {
            if key == "Known" {
                Ok(())
            } else {
                Err(ModuleError::InvalidOption {
                    key: key.into(),
                    reason: "unknown".into(),
                })
            }
        }
    }

    impl Module for Counter {
        fn as_init(&self) -> Option<&dyn Init> {
            Some(self)
        }
        fn as_collect(&self) -> Option<&dyn Collect> {
            Some(self)
        }
        fn as_config(&self) -> Option<&dyn Configure> {
            Some(self)
        }
    }

    fn loaded(plugins: Vec<PluginConfig>) -> LoadedConfig {
        let app = AppConfig {
            interval: Duration::from_millis(20),
            plugins,
            ..Default::default()
        };
        LoadedConfig::new(app, TypesDb::parse("gauge\tvalue:GAUGE:U:U\n"))
    }

    fn provider(module: Arc<Counter>) -> Arc<dyn ModuleProvider> {
        Arc::new(
            StaticProvider::new()
                .with("counter", move || Some(module.clone() as Arc<dyn Module>)),
        )
    }

    #[test]
    fn test_read_once_mode() {
        let module = Arc::new(Counter::default());
        let daemon = Daemon::configure(
            &loaded(vec![PluginConfig::new("counter")]),
            provider(module.clone()),
        )
        .unwrap();
        assert_eq!(daemon.state(), DaemonState::Configured);

        daemon.run(RunMode::ReadOnce).unwrap();
        assert_eq!(module.reads.load(Ordering::SeqCst), 1);
        assert_eq!(daemon.state(), DaemonState::Terminated);
        assert!(daemon.service().registry().is_empty());
        assert_eq!(daemon.service().dispatcher().stats().written, 1);
    }

    #[test]
    fn test_read_once_failure_is_reported() {
        let module = Arc::new(Counter {
            fail_read: true,
            ..Default::default()
        });
        let daemon = Daemon::configure(
            &loaded(vec![PluginConfig::new("counter")]),
            provider(module),
        )
        .unwrap();

        let err = daemon.run(RunMode::ReadOnce).unwrap_err();
        assert!(matches!(err, DaemonError::Service(ServiceError::FanOut { .. })));
    }

    #[test]
    fn test_init_failure_is_fatal_before_running() {
        let module = Arc::new(Counter {
            fail_init: true,
            ..Default::default()
        });
        let daemon = Daemon::configure(
            &loaded(vec![PluginConfig::new("counter")]),
            provider(module.clone()),
        )
        .unwrap();

        let err = daemon.run(RunMode::Daemon).unwrap_err();
        assert!(matches!(err, DaemonError::Init(_)));
        assert_eq!(module.reads.load(Ordering::SeqCst), 0);
        assert_eq!(daemon.state(), DaemonState::Terminated);
    }

    #[test]
    fn test_configure_fails_on_missing_plugin_or_bad_option() {
        let module = Arc::new(Counter::default());
        let err = Daemon::configure(
            &loaded(vec![PluginConfig::new("counter"), PluginConfig::new("ghost")]),
            provider(module.clone()),
        )
        .unwrap_err();
        assert!(matches!(err, DaemonError::Configure { failed: 1 }));

        let err = Daemon::configure(
            &loaded(vec![
                PluginConfig::new("counter")
                    .with_option("Known", "x")
                    .with_option("Bogus", 1),
            ]),
            provider(module),
        )
        .unwrap_err();
        assert!(matches!(err, DaemonError::Configure { failed: 1 }));
    }

    #[test]
    fn test_daemon_mode_runs_until_stopped() {
        let module = Arc::new(Counter::default());
        let daemon = Daemon::configure(
            &loaded(vec![PluginConfig::new("counter")]),
            provider(module.clone()),
        )
        .unwrap();
        let handle = daemon.handle();

        let runner = thread::spawn(move || {
            let result = daemon.run(RunMode::Daemon);
            (result, daemon)
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while module.reads.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handle.state(), DaemonState::Running);

        handle.trigger_flush().unwrap().join().unwrap();
        handle.stop();
        let (result, daemon) = runner.join().unwrap();

        result.unwrap();
        assert!(module.reads.load(Ordering::SeqCst) >= 3);
        assert_eq!(daemon.state(), DaemonState::Terminated);
    }

    #[test]
    fn test_run_twice_is_rejected() {
        let daemon = Daemon::configure(&loaded(vec![]), provider(Arc::default())).unwrap();
        daemon.run(RunMode::FlushOnce).unwrap();
        assert!(matches!(
            daemon.run(RunMode::FlushOnce).unwrap_err(),
            DaemonError::State(DaemonState::Terminated)
        ));
    }

    #[test]
    fn test_run_mode_from_str() {
        use std::str::FromStr;
        assert_eq!(RunMode::from_str("read-once").unwrap(), RunMode::ReadOnce);
        assert_eq!(RunMode::from_str("FLUSH-ONCE").unwrap(), RunMode::FlushOnce);
        assert_eq!(RunMode::default(), RunMode::Daemon);
    }

    /// Writer-side module counting flushes and shutdowns.
    #[derive(Default)]
    struct Closer {
        flushes: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    impl Flush for Closer {
        fn flush(&self) -> ModuleResult {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl Shutdown for Closer {
        fn shutdown(&self) -> ModuleResult {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl Module for Closer {
        fn as_flush(&self) -> Option<&dyn Flush> {
            Some(self)
        }
        fn as_shutdown(&self) -> Option<&dyn Shutdown> {
            Some(self)
        }
    }

    fn closer_daemon(closer: &Arc<Closer>) -> Daemon {
        let closer = Arc::clone(closer);
        let provider = StaticProvider::new()
            .with("closer", move || Some(closer.clone() as Arc<dyn Module>));
        Daemon::configure(&loaded(vec![PluginConfig::new("closer")]), Arc::new(provider)).unwrap()
    }

    #[test]
    fn test_flush_once_flushes_exactly_once() {
        let closer = Arc::new(Closer::default());
        let daemon = closer_daemon(&closer);

        daemon.run(RunMode::FlushOnce).unwrap();
        assert_eq!(closer.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(closer.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_without_run_tears_modules_down() {
        let closer = Arc::new(Closer::default());
        let daemon = closer_daemon(&closer);

        daemon.shutdown().unwrap();
        assert_eq!(closer.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(closer.flushes.load(Ordering::SeqCst), 0);
        assert_eq!(daemon.state(), DaemonState::Terminated);
        assert!(daemon.service().registry().is_empty());

        assert!(matches!(
            daemon.shutdown().unwrap_err(),
            DaemonError::State(DaemonState::Terminated)
        ));
    }
}
