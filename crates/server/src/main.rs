mod bootstrap;
mod execute;
mod health;

use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use rulepay_core::config::{AppConfig, LoadOptions};
use tracing_subscriber::EnvFilter;

fn init_logging(config: &AppConfig) {
    use rulepay_core::config::LogFormat::*;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Logging needs the loaded config, so load it once and hand it to bootstrap.
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    let router = Router::new()
        .merge(health::router(health::HealthState {
            db_pool: app.db_pool.clone(),
            dataset: app.dataset.clone(),
        }))
        .merge(execute::router(execute::ExecuteState {
            pipeline: app.pipeline.clone(),
            signing_secret: app.config.scheduler.signing_secret.clone(),
        }));

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        address = %address,
        signatures_required = app.config.scheduler.signing_secret.is_some(),
        "rulepay-server listening"
    );

    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    let server = axum::serve(listener, router).with_graceful_shutdown(wait_for_shutdown());
    server.await.context("http server failed")?;

    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        grace_secs = grace.as_secs(),
        "rulepay-server stopping"
    );
    if tokio::time::timeout(grace, app.db_pool.close()).await.is_err() {
        tracing::warn!(
            event_name = "system.server.shutdown_timeout",
            correlation_id = "shutdown",
            "database pool did not close within the grace period"
        );
    }

    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(
            event_name = "system.server.signal_failed",
            correlation_id = "shutdown",
            error = %error,
            "failed to listen for shutdown signal"
        );
    }
}
