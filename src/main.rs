//! Container Log Shim Binary

use clap::Parser;
use log_shim::cli::Cli;
use log_shim::input::{open_path, open_stdin};
use log_shim::options::DestinationConfig;
use log_shim::{Destination, FileDestination, HttpDestination, Pipeline, Result, Source};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long the runtime waits on blocking-pool reads once the pipeline stopped
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(start());
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
    result
}

async fn start() -> Result<()> {
    // Initialize tracing
    initialize_tracing();

    info!("Starting container log shim v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let config = cli.config();

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    let destination = match cli.destination_config() {
        Ok(destination) => destination,
        Err(e) => {
            error!("Invalid log options: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Shim configuration - Destination: {}, Container: {}, Queue: {} ({}), \
         Max batch: {} records / {} bytes",
        destination.kind(),
        cli.container_id,
        config.queue_capacity,
        config.overflow_policy,
        config.batch.max_records,
        config.batch.max_bytes
    );

    let result = match destination {
        DestinationConfig::Http(options) => {
            run(&cli, config, HttpDestination::new(options)?).await
        }
        DestinationConfig::File(options) => {
            run(&cli, config, FileDestination::new(options)?).await
        }
    };

    if let Err(e) = result {
        error!("Shim failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn run<D>(cli: &Cli, config: log_shim::Config, destination: D) -> Result<()>
where
    D: Destination + 'static,
{
    let mut pipeline = Pipeline::new(config, destination)?;

    match (&cli.stdout, &cli.stderr) {
        (None, None) => {
            info!("No pipes given, reading stdin as the stdout stream");
            pipeline = pipeline.with_source(Source::Stdout, open_stdin()?);
        }
        (stdout, stderr) => {
            if let Some(path) = stdout {
                pipeline = pipeline.with_source(Source::Stdout, open_path(path).await?);
            }
            if let Some(path) = stderr {
                pipeline = pipeline.with_source(Source::Stderr, open_path(path).await?);
            }
        }
    }

    let report = pipeline.run(shutdown_signal()).await?;
    if report.deadline_elapsed {
        warn!(
            "Drain deadline elapsed, {} records were reported lost",
            report.stats.records_lost()
        );
    }

    info!("Container log shim shutdown complete");
    Ok(())
}

/// Completes on ctrl-c or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received ctrl-c"),
        () = terminate => info!("Received SIGTERM"),
    }
}

/// Initialize structured logging
fn initialize_tracing() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .json();

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&log_level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
