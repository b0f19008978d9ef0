use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ghapp_bridge::cli::{run_command, Cli};
use ghapp_bridge::config::Config;
use ghapp_bridge::github::spawn_purge_task;
use ghapp_bridge::outcomes::HttpAggregationService;
use ghapp_bridge::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;

    // --log-level wins over RUST_LOG, which wins over the config file
    let filter = match &cli.log_level {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    if run_command(&cli).await? {
        return Ok(());
    }

    tracing::info!("Starting ghapp-bridge v{}", env!("CARGO_PKG_VERSION"));

    let db = ghapp_bridge::db::init(&config.server.data_dir).await?;
    let outcomes = Arc::new(HttpAggregationService::new(&config.outcomes)?);

    if config.auth.encryption_key.is_none() {
        tracing::warn!("No encryption key configured; GitHub credentials are stored in plaintext");
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let purge_interval = Duration::from_secs(config.github.cache_ttl_secs.max(1));
    let state = Arc::new(AppState::new(config, db, outcomes));
    spawn_purge_task(state.github_cache.clone(), purge_interval);
    let app = ghapp_bridge::api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
