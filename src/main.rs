use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::clock::SystemClock;
use turnstile::config::GatewayConfig;
use turnstile::http::{AppState, HttpServer};
use turnstile::metrics;
use turnstile::ratelimit::AdmissionEngine;
use turnstile::store;

/// Request admission gateway with multi-window rate limits and monthly quotas.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Override the log level filter (e.g. "debug", "turnstile=trace")
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON logs (`--json false` for human-readable output)
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    json: Option<bool>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = GatewayConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(json) = cli.json {
        config.logging.json = json;
    }

    init_tracing(&config);

    info!("Starting Turnstile admission gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        listen_addr = %config.server.listen_addr,
        backend = ?config.store.backend,
        requests_per_minute = config.policy.requests_per_minute,
        requests_per_hour = config.policy.requests_per_hour,
        requests_per_day = config.policy.requests_per_day,
        monthly_quota = config.policy.monthly_quota,
        admission = ?config.policy.admission,
        "Configuration loaded"
    );

    let store = store::connect(&config.store, Arc::new(SystemClock)).await?;
    info!(backend = store.backend_name(), "Counter store ready");

    let mut engine = AdmissionEngine::new(store, config.policy.clone());
    if let Some(timeout) = config.store_timeout() {
        engine = engine.with_store_timeout(timeout);
    }

    let recorder = metrics::install()?;
    metrics::spawn_upkeep(recorder.clone(), Duration::from_secs(5));

    let state =
        AppState::new(Arc::new(engine), &config.server.caller_header)?.with_metrics(recorder);
    let server = HttpServer::new(config.server.listen_addr, state);

    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Turnstile admission gateway stopped");
    Ok(())
}

fn init_tracing(config: &GatewayConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if config.logging.json {
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
