use std::sync::Arc;

use tokio::net::TcpListener;

use chat_dispatcher::config::Config;
use chat_dispatcher::engine::build_engine;
use chat_dispatcher::{app, logging, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    logging::init_tracing(&config.logging);

    tracing::info!("Starting chat dispatcher");

    let engine = build_engine(&config.engine);
    if let Err(e) = engine.health_check().await {
        tracing::warn!(engine = engine.engine_type(), "Engine not reachable at startup: {}", e);
    }

    let state = Arc::new(AppState::from_config(config.clone(), engine));
    let reaper = state.dispatcher.spawn_reaper();

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.dispatcher.shutdown().await;
    if let Err(e) = reaper.await {
        tracing::warn!("Reaper task ended abnormally: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
