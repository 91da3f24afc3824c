//! Outreach - Campaign dispatch service entry point

use anyhow::{Context, Result};
use outreach_api::{create_router, AppState};
use outreach_common::config::{Config, LoggingConfig};
use outreach_core::{CloudApiGateway, DispatchMetrics, DispatchSettings, DispatchWorker, Dispatcher};
use outreach_storage::{DatabasePool, MemoryStore, Repositories};
use prometheus::Registry;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so logging can honour it
    let config = Config::load()?;

    init_logging(&config.logging);

    info!("Starting Outreach dispatch service...");

    // Initialize storage
    let (repos, db_pool) = match config.database.backend.as_str() {
        "memory" => {
            warn!("Using in-memory storage; data is lost on shutdown");
            (Repositories::memory(MemoryStore::new()), None)
        }
        _ => {
            let db_pool = DatabasePool::new(&config.database)
                .await
                .context("Failed to connect to database")?;
            if config.database.run_migrations {
                db_pool.migrate().await?;
            }
            (Repositories::postgres(db_pool.clone()), Some(db_pool))
        }
    };

    // Initialize gateway client
    if config.gateway.access_token.is_none() {
        warn!("No gateway access token configured; sends will be rejected");
    }
    let gateway = CloudApiGateway::new(config.gateway.clone())
        .context("Failed to build gateway client")?;

    // Initialize dispatcher
    let registry = Registry::new();
    let metrics = DispatchMetrics::new(&registry).context("Failed to register metrics")?;
    let settings = DispatchSettings::from(&config.dispatcher);
    info!(
        batch_size = settings.batch_size,
        send_interval_ms = settings.send_interval.as_millis() as u64,
        "Dispatcher configured"
    );
    let dispatcher = Arc::new(
        Dispatcher::new(repos, Arc::new(gateway), settings).with_metrics(metrics),
    );

    let shutdown = CancellationToken::new();

    // Start dispatch worker if enabled
    let worker_handle = if config.dispatcher.enabled {
        let worker = DispatchWorker::new(dispatcher.clone())
            .with_poll_interval(config.dispatcher.interval_secs)
            .with_shutdown(shutdown.clone());
        Some(tokio::spawn(async move {
            worker.run().await;
        }))
    } else {
        info!("Dispatch worker disabled; runs happen only via the trigger route");
        None
    };

    // Start API server
    let mut state = AppState::new(dispatcher, registry)
        .with_trigger_token(config.api.trigger_token.clone());
    if let Some(pool) = db_pool {
        state = state.with_db_pool(pool);
    }
    if state.trigger_token.is_none() {
        warn!("Dispatch trigger is not protected by a token");
    }
    let app = create_router(state, &config.api);

    let addr = format!("{}:{}", config.server.bind_address, config.api.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind API server on {}", addr))?;
    info!("Starting API server on {}", addr);

    let server_shutdown = shutdown.clone();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        server_shutdown.cancel();
    });

    if let Err(e) = serve.await {
        error!("API server error: {}", e);
        shutdown.cancel();
    }

    // Let an in-flight dispatch run finish
    if let Some(handle) = worker_handle {
        if let Err(e) = handle.await {
            error!("Dispatch worker panicked: {}", e);
        }
    }

    info!("Outreach shutdown complete");

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},outreach=debug", config.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry
            .with(fmt::layer().json().with_target(true).with_level(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
