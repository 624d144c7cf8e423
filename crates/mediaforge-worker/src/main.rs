//! Worker process: runs the transcode, thumbnail and document-preview pools
//! plus the maintenance sweep until SIGINT/SIGTERM.
//!
//! Usage: `mediaforge-worker [CONFIG]`. Without an argument the config path
//! comes from `MEDIAFORGE_CONFIG`, then `~/.mediaforge/config.json`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info, warn};
use mediaforge::config::LogFormat;
use mediaforge::{load_config, resolve_config_path, Config, ConversionService};
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

fn main() -> ExitCode {
    let explicit = std::env::args_os().nth(1).map(PathBuf::from);
    let config = match resolve_config_path(explicit).and_then(load_config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("mediaforge-worker: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(config.log_format) {
        eprintln!("mediaforge-worker: failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to start tokio runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(config))
}

/// Bridges `log` records into tracing and installs a fmt subscriber.
/// `RUST_LOG` overrides the default `info` filter.
fn init_logging(format: LogFormat) -> Result<(), Box<dyn std::error::Error>> {
    tracing_log::LogTracer::init()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => tracing::subscriber::set_global_default(
            registry.with(fmt::layer().json().with_span_list(true)),
        )?,
        LogFormat::Text => tracing::subscriber::set_global_default(
            registry.with(fmt::layer().with_target(true)),
        )?,
    }
    Ok(())
}

async fn run(config: Config) -> ExitCode {
    let grace = config.workers.shutdown_grace();
    let service = match ConversionService::open(config) {
        Ok(service) => service,
        Err(e) => {
            error!("Failed to open conversion service: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let shutdown = Arc::new(Notify::new());
    let signal = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || signal.notify_one()) {
        error!("Failed to install signal handler: {}", e);
        return ExitCode::FAILURE;
    }

    info!(
        "Starting mediaforge worker v{} (storage root {})",
        env!("CARGO_PKG_VERSION"),
        service.layout().root().display()
    );

    let workers = service.start_workers();
    let maintenance = service.maintenance();
    let maintenance_task = maintenance.start();

    shutdown.notified().await;
    info!("Shutdown requested; waiting up to {:?} for running jobs", grace);

    maintenance.stop();
    let aborted = workers.wait(grace).await;
    if let Err(e) = maintenance_task.await {
        error!("Maintenance task failed: {}", e);
    }

    if aborted > 0 {
        warn!(
            "{} jobs were interrupted and will be picked up by the next stall sweep",
            aborted
        );
    }
    info!("mediaforge worker stopped");
    ExitCode::SUCCESS
}
