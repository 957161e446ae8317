// Conveyor server
//
// Hosts the worker trigger surface and the background stage consumers over a
// shared PostgreSQL-backed job store.

mod config;
mod consumer;
mod processor;
mod routes;

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conveyor_queue::{FanoutTrigger, JobProcessor, JobStore, PostgresJobStore};

use config::ServerConfig;
use consumer::PhaseQueueFanout;
use processor::HttpCollaborator;
use routes::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conveyor_server=debug,conveyor_queue=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("conveyor-server starting...");

    let config = ServerConfig::from_env();
    let database_url = config
        .database_url
        .clone()
        .context("DATABASE_URL environment variable required")?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .context("Failed to connect to database")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Connected to database");

    let store: Arc<dyn JobStore> = Arc::new(PostgresJobStore::new(pool));
    let processor: Arc<dyn JobProcessor> =
        Arc::new(HttpCollaborator::new(config.collaborator_url()));
    let fanout: Arc<dyn FanoutTrigger> = Arc::new(PhaseQueueFanout::new(
        Arc::clone(&store),
        config.queue_prefix(),
    ));
    tracing::info!(
        collaborator = %config.collaborator_url(),
        total_shards = config.total_shards(),
        "store and collaborator configured"
    );

    let cancel = CancellationToken::new();
    let consumer_handles = if config.consumers_enabled() {
        let handles = consumer::spawn_consumers(
            Arc::clone(&store),
            Arc::clone(&processor),
            Arc::clone(&fanout),
            &config,
            cancel.clone(),
        );
        tracing::info!(tasks = handles.len(), "stage consumers running");
        handles
    } else {
        tracing::info!("stage consumers disabled, trigger-only mode");
        Vec::new()
    };

    let state = AppState {
        store,
        processor,
        fanout,
        config: config.clone(),
    };
    let app = routes::routes(state).layer(TraceLayer::new_for_http());

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Stop consumers after the HTTP surface has drained
    cancel.cancel();
    for handle in consumer_handles {
        let _ = handle.await;
    }
    tracing::info!("conveyor-server shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
