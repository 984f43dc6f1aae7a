//! Outreach - Delivery service entry point

use anyhow::Result;
use outreach_api::{create_router, AppState};
use outreach_common::config::{Config, LoggingConfig};
use outreach_common::SystemClock;
use outreach_core::{HttpGateway, OutreachCore, Repositories};
use outreach_storage::{DatabasePool, MemoryStore};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_logging(&config.logging);

    info!("Starting outreach delivery service...");

    // Storage backend
    let (repos, db_pool) = match config.database.backend.as_str() {
        "memory" => {
            warn!("Using in-memory storage; state is lost on restart");
            (Repositories::memory(MemoryStore::new()), None)
        }
        _ => {
            let pool = DatabasePool::new(&config.database).await?;
            pool.migrate().await?;
            (Repositories::postgres(pool.clone()), Some(pool))
        }
    };

    let gateway = Arc::new(HttpGateway::new(&config.gateway)?);
    let core = Arc::new(OutreachCore::new(
        &config,
        repos,
        gateway,
        Arc::new(SystemClock),
    )?);

    // Send scheduler
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = tokio::spawn(core.scheduler().run(shutdown_rx));

    // Webhook intake and operator API
    let mut state = AppState::new(core.clone())
        .with_signing_secret(config.webhooks.signing_secret.clone());
    if let Some(pool) = db_pool {
        state = state.with_db_pool(pool);
    }
    if state.signing_secret.is_none() {
        warn!("No webhook signing secret configured; signatures are not verified");
    }
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.webhooks.bind).await?;
    info!(bind = %config.webhooks.bind, "Starting HTTP server");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler_handle.await {
        warn!(error = %e, "Send scheduler task ended abnormally");
    }

    info!("Outreach delivery service shutdown complete");

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},outreach=debug", config.level)));

    if config.format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true).with_level(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_level(true))
            .with(filter)
            .init();
    }
}
