//! telemetryd Binary Entry Point
//!
//! Loads the configuration, wires the daemon and supervises signals.
//! Core functionality is provided by the `telemetryd` library crate.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use telemetryd::{
    ChainProvider, Daemon, DaemonHandle, DylibProvider, LoadedConfig, RunMode, UserConfig,
    logging, modules::builtin_provider,
};

/// telemetryd - Telemetry Collection Daemon
#[derive(Parser, Debug)]
#[command(name = "telemetryd", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short = 'C',
        long,
        default_value = "configs/config.yaml",
        env = "TELEMETRYD_CONFIG"
    )]
    config: String,

    /// Test the configuration and exit
    #[arg(short = 't', long)]
    test_config: bool,

    /// Read every collector once and exit
    #[arg(short = 'T', long, conflicts_with = "test_flush")]
    test_read: bool,

    /// Flush every writer once and exit
    #[arg(short = 'F', long)]
    test_flush: bool,

    /// Do not create the base directory
    #[arg(short = 'B', long)]
    no_create_base_dir: bool,
}

impl Cli {
    fn mode(&self) -> RunMode {
        if self.test_read {
            RunMode::ReadOnce
        } else if self.test_flush {
            RunMode::FlushOnce
        } else {
            RunMode::Daemon
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let log = logging::init();
    let cli = Cli::parse();

    tracing::info!(config = %cli.config, "telemetryd starting");
    let config = match LoadedConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(path = %cli.config, error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    if let Some(path) = &config.app.user_config
        && let Err(e) = UserConfig::load_and_apply(path, log.as_ref())
    {
        tracing::warn!(path = %path.display(), error = %e, "Ignoring user configuration");
    }

    let provider = ChainProvider::new()
        .with(Arc::new(builtin_provider()))
        .with(Arc::new(DylibProvider));

    let daemon = match Daemon::builder(&config, Arc::new(provider))
        .log_control(Arc::clone(&log))
        .create_base_dir(!cli.no_create_base_dir)
        .configure()
    {
        Ok(daemon) => daemon,
        Err(e) => {
            tracing::error!(error = %e, "Failed to configure daemon");
            return ExitCode::FAILURE;
        }
    };

    if cli.test_config {
        if let Err(e) = daemon.shutdown() {
            tracing::error!(error = %e, "Failed to shut down after configuration test");
            return ExitCode::FAILURE;
        }
        tracing::info!("Configuration OK");
        return ExitCode::SUCCESS;
    }

    let mode = cli.mode();
    let supervisor = tokio::spawn(supervise(daemon.handle()));
    let runner = tokio::task::spawn_blocking(move || daemon.run(mode));

    let code = match runner.await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            tracing::error!(mode = %mode, error = %e, "Daemon exited with error");
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!(error = %e, "Daemon thread panicked");
            ExitCode::FAILURE
        }
    };

    supervisor.abort();
    tracing::info!("Shutdown complete");
    code
}

/// Translate signals into daemon triggers until a stop is requested.
///
/// SIGINT/SIGTERM stop the loop, SIGUSR1 flushes, SIGUSR2 reloads the user
/// configuration. Flush and reload run on their own threads.
#[cfg(unix)]
async fn supervise(handle: DaemonHandle) {
    use tokio::signal::unix::{SignalKind, signal};

    let signals = (|| {
        Ok::<_, std::io::Error>((
            signal(SignalKind::interrupt())?,
            signal(SignalKind::terminate())?,
            signal(SignalKind::user_defined1())?,
            signal(SignalKind::user_defined2())?,
        ))
    })();
    let (mut int, mut term, mut usr1, mut usr2) = match signals {
        Ok(signals) => signals,
        Err(e) => {
            tracing::error!(error = %e, "Failed to install signal handlers");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = int.recv() => {
                tracing::info!("Received SIGINT");
                break;
            }
            _ = term.recv() => {
                tracing::info!("Received SIGTERM");
                break;
            }
            _ = usr1.recv() => {
                tracing::info!("Received SIGUSR1, flushing");
                if let Err(e) = handle.trigger_flush() {
                    tracing::error!(error = %e, "Failed to spawn flush thread");
                }
            }
            _ = usr2.recv() => {
                tracing::info!("Received SIGUSR2, reloading user configuration");
                if let Err(e) = handle.trigger_reload() {
                    tracing::error!(error = %e, "Failed to spawn reload thread");
                }
            }
        }
    }

    handle.stop();
}

#[cfg(not(unix))]
async fn supervise(handle: DaemonHandle) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received Ctrl+C signal"),
        Err(e) => tracing::error!(error = %e, "Failed to install Ctrl+C handler"),
    }
    handle.stop();
}
