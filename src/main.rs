use capture_scheduler::{
    install_prometheus_exporter, monitor_health, read_config, setup_logging, validate_config, Cli,
    CliRunner, Commands, Config,
};
use clap::Parser;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Cli::parse();

    setup_logging(args.verbose)?;

    info!("Starting capture-scheduler v{}", env!("CARGO_PKG_VERSION"));

    // Validation must not need a browser.
    if let Commands::Validate { config } = &args.command {
        return validate_config(config).await;
    }

    let config = load_config(&args).await?;

    // Before the scheduler registers its metric handles.
    if let Some(port) = args.metrics_port {
        install_prometheus_exporter(port)?;
    }

    let cli_runner = CliRunner::new(config).await?;
    tokio::spawn(monitor_health(
        cli_runner.scheduler.clone(),
        HEALTH_CHECK_INTERVAL,
    ));

    let result = tokio::select! {
        result = cli_runner.run(args.command) => {
            info!("Application completed");
            result
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
            Ok(())
        }
    };

    // Queued captures are cancelled; running ones are signalled and awaited.
    info!("Shutting down...");
    cli_runner.shutdown().await;

    if let Err(e) = result {
        error!("Application error: {}", e);
        std::process::exit(1);
    }

    info!("capture-scheduler stopped");
    Ok(())
}

async fn load_config(args: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => read_config(path).await?,
        None => Config::default(),
    };

    args.apply_overrides(&mut config);
    config.validate()?;

    info!("Configuration loaded successfully");
    info!("Workers: {}", config.scheduler.worker_count);
    info!("Queue capacity: {}", config.scheduler.queue_capacity);
    info!("Max attempts: {}", config.scheduler.max_attempts);
    info!("Output directory: {}", config.output_dir.0.display());

    Ok(config)
}

async fn shutdown_signal() {
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            let _ = signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
    }
}
