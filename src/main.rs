use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use axum::http::HeaderName;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use httplimit::config::AppConfig;
use httplimit::ratelimit::{keys, QuotaLayer, QuotaLimiter};
use httplimit::HttplimitError;

/// Serve an HTTP endpoint protected by multi-tier quotas.
#[derive(Debug, Parser)]
#[command(name = "httplimit", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides server.addr
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Redis URL for shared quotas, overrides limiter.redis_url
    #[arg(long)]
    redis_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting httplimit");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.server.addr = addr;
    }
    if let Some(url) = args.redis_url {
        config.limiter.redis_url = Some(url);
    }
    info!(
        addr = %config.server.addr,
        shared = config.limiter.redis_url.is_some(),
        quotas = config.limiter.quotas.len(),
        "Configuration loaded"
    );

    let limiter = QuotaLimiter::with_options(config.limiter.options());

    // A limiter that cannot reach its stores must not serve traffic
    let layer = match build_layer(&limiter, &config).await {
        Ok(layer) => layer,
        Err(err) => {
            if let Err(cleanup) = limiter.cleanup().await {
                error!(error = %cleanup, "Limiter cleanup failed");
            }
            return Err(err).context("failed to build quota middleware");
        }
    };

    let app = Router::new().route("/", get(|| async { "ok" })).layer(layer);

    let listener = tokio::net::TcpListener::bind(config.server.addr).await?;
    info!("Listening on {}", config.server.addr);

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    if let Err(err) = limiter.cleanup().await {
        error!(error = %err, "Limiter cleanup failed");
    }
    served?;

    info!("httplimit stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn build_layer(limiter: &QuotaLimiter, config: &AppConfig) -> httplimit::Result<QuotaLayer> {
    let quotas = config.limiter.quotas();

    match &config.server.key_header {
        Some(name) => {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| HttplimitError::Config(format!("invalid key_header: {}", e)))?;
            limiter.middleware(quotas, keys::header(name)).await
        }
        None => {
            limiter
                .middleware(quotas, keys::client_ip(config.server.trust_proxy))
                .await
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
///
/// A handler that cannot be installed is logged and never fires, so the
/// server keeps running on the remaining signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
