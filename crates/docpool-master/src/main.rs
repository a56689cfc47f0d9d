//! docpool-master - master process entry point.
//!
//! Loads configuration, initializes logging, installs the fatal panic hook,
//! and runs the worker-pool control loop until shutdown.

use std::io::Write;
use std::panic;

use anyhow::{Context, Result};
use tracing::info;

use docpool_master::config::{LoggingConfig, MasterConfig};
use docpool_master::controller::MasterController;
use docpool_master::license::{FileLicenseSource, LicenseWatcher};
use docpool_master::process::ClusterManager;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config = MasterConfig::load().context("Failed to load configuration")?;

    init_logging(&config.logging);
    install_panic_hook();

    info!("docpool master starting...");

    let cpu_count = config.effective_cpu_count();
    info!(
        "{} CPUs, {} workers per CPU",
        cpu_count, config.server.workerpercpu
    );

    let worker_cmd = config
        .resolve_worker_cmd()
        .context("Failed to resolve worker command")?;
    info!("worker command: {}", worker_cmd.display());
    info!("license file: {}", config.license.license_file.display());

    let manager = ClusterManager::new(worker_cmd, config.server.worker_args.clone());
    let source = FileLicenseSource::new(config.license.license_file.clone());
    let watcher = LicenseWatcher::new(config.license.license_file.clone());

    let mut controller =
        MasterController::new(manager, source, cpu_count, config.server.workerpercpu);

    controller
        .run(watcher, config.intervals())
        .await
        .context("fatal fault in master control logic")?;

    info!("master shutdown complete");
    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.log_level)),
        )
        .with_target(false)
        .init();
}

/// An uncaught fault in the master's own control logic is fatal: log it,
/// flush, and let the process die so the external supervisor restarts it.
fn install_panic_hook() {
    let original_hook = panic::take_hook();

    panic::set_hook(Box::new(move |info| {
        // Write directly to stderr since logging may itself be broken.
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "fatal: uncaught fault in master process");
        if let Some(location) = info.location() {
            let _ = writeln!(
                stderr,
                "  at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            );
        }
        if let Some(message) = info.payload().downcast_ref::<&str>() {
            let _ = writeln!(stderr, "  {}", message);
        } else if let Some(message) = info.payload().downcast_ref::<String>() {
            let _ = writeln!(stderr, "  {}", message);
        }
        let _ = stderr.flush();

        original_hook(info);
    }));
}
