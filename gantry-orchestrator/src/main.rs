use anyhow::Context;
use clap::Parser;
use gantry_client::AgentClient;
use gantry_orchestrator::api::auth::StaticTokens;
use gantry_orchestrator::config::Config;
use gantry_orchestrator::repository::{JobStore, MemoryJobStore, PgJobStore};
use gantry_orchestrator::service::AgentDispatcher;
use gantry_orchestrator::{Orchestrator, db};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gantry_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse();
    config.validate().context("Invalid configuration")?;

    tracing::info!("Starting Gantry Orchestrator...");

    let store: Arc<dyn JobStore> = match &config.database_url {
        Some(database_url) => {
            tracing::info!("Connecting to database...");

            let pool = db::create_pool(database_url)
                .await
                .context("Failed to create database pool")?;

            tracing::info!("Database connection pool created");

            db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;

            Arc::new(PgJobStore::new(pool, config.retry_limit))
        }
        None => {
            tracing::warn!("No database configured, jobs are kept in memory only");
            Arc::new(MemoryJobStore::new(config.retry_limit))
        }
    };

    let identities = StaticTokens::parse(&config.api_tokens).context("Invalid API tokens")?;
    tracing::info!("Loaded {} API token(s)", identities.len());

    let client = AgentClient::new(config.agent_timeout()).context("Failed to build agent client")?;
    let dispatcher = Arc::new(AgentDispatcher::new(client));

    let orchestrator = Orchestrator::new(&config, store, dispatcher, Arc::new(identities));

    // nothing holds reservations yet, so jobs left in flight cannot be trusted
    orchestrator
        .monitor()
        .recover_orphans()
        .await
        .context("Failed to recover in-flight jobs")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background = orchestrator.spawn_background(shutdown_rx.clone());

    // Build router with all API endpoints
    let app = orchestrator.router(shutdown_rx);

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    // event feeds, log follows and both loops must see the flag before the
    // server waits for open connections to drain
    let shutdown = async move {
        shutdown_signal().await;
        tracing::info!("Shutting down background loops and streams...");
        let _ = shutdown_tx.send(true);
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;

    for handle in background {
        if let Err(e) = handle.await {
            tracing::error!("Background task failed: {}", e);
        }
    }

    tracing::info!("Gantry Orchestrator stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        // without a signal handler, run until killed
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
