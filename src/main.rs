use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::BufReader;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gatekeeper::config::{GatekeeperConfig, LoggingConfig};
use gatekeeper::frontend::LineServer;
use gatekeeper::ratelimit::Limiter;

/// Per-client sliding window admission control.
///
/// Reads one client identity per line on stdin and writes one JSON decision
/// per line on stdout.
#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Requests admitted per client within one window
    #[arg(long)]
    limit: Option<u64>,

    /// Sliding window length in seconds
    #[arg(long)]
    window_secs: Option<u64>,

    /// Seconds between sweeps of idle clients
    #[arg(long)]
    cleanup_interval_secs: Option<u64>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    /// Overlay command-line flags on the loaded configuration.
    fn apply(&self, config: &mut GatekeeperConfig) {
        if let Some(limit) = self.limit {
            config.limiter.limit = limit;
        }
        if let Some(window_secs) = self.window_secs {
            config.limiter.window_secs = window_secs;
        }
        if let Some(interval) = self.cleanup_interval_secs {
            config.limiter.cleanup_interval_secs = interval;
        }
        if self.json_logs {
            config.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    init_tracing(&config.logging);

    info!("Starting Gatekeeper admission control");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &cli.config {
        info!(path = %path.display(), "Configuration file read");
    }
    info!(
        limit = config.limiter.limit,
        window_secs = config.limiter.window_secs,
        cleanup_interval_secs = config.limiter.cleanup_interval_secs,
        "Configuration loaded"
    );

    let limiter = Arc::new(Limiter::from_config(&config.limiter)?);
    limiter.start_cleanup(config.limiter.cleanup_interval())?;

    let server = LineServer::new(Arc::clone(&limiter));
    let stats = server
        .serve_with_shutdown(
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
            shutdown_signal(),
        )
        .await?;

    limiter.stop_cleanup();

    info!(
        allowed = stats.allowed,
        denied = stats.denied,
        invalid = stats.invalid,
        tracked_keys = limiter.tracked_keys(),
        "Gatekeeper stopped"
    );
    Ok(())
}

/// Layer file and environment settings, apply flags, then validate the result.
///
/// Runs before any subscriber is installed, so it does not log.
fn load_config(cli: &Cli) -> anyhow::Result<GatekeeperConfig> {
    let mut config = GatekeeperConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;
    Ok(config)
}

/// Install the global subscriber. Logs go to stderr; stdout carries decisions.
fn init_tracing(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
