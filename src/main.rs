use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratekeeper::config::RatekeeperConfig;
use ratekeeper::http::HttpServer;
use ratekeeper::ratelimit::RateLimiter;
use ratekeeper::storage::RedisStorage;

/// Request rate limiter in front of an HTTP service
#[derive(Parser, Debug)]
#[command(name = "ratekeeper", version, about)]
struct Args {
    /// YAML configuration file; when set, environment variables are not read
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// KEY=VALUE file layered under the process environment [default: config.env if present]
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Ratekeeper");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => RatekeeperConfig::from_file(path)?,
        None => RatekeeperConfig::load(args.env_file.as_deref())?,
    };
    info!(
        addr = %config.server.addr(),
        ip_limit = config.limits.ip_limit,
        token_limit = config.limits.token_limit,
        "Configuration loaded"
    );

    // The limiter cannot decide anything without its store, so this is fatal.
    let storage = RedisStorage::connect(&config.redis).await?;
    info!("Redis storage initialized");

    let rate_limiter = Arc::new(RateLimiter::new(Arc::new(storage), config.limits));
    let http_server = HttpServer::new(&config.server, rate_limiter);

    // Run the server with graceful shutdown on Ctrl+C
    http_server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Ratekeeper stopped");
    Ok(())
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
