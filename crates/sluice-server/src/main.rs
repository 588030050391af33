//! Sluice Server - HTTP edge for the LLM serving control plane

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod error;
mod state;

use sluice_core::{DataProcessor, Engine, EngineConfig, SocketExecutor};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sluice_server=debug,sluice_core=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Sluice Server");

    // Startup validation failures exit non-zero before any thread spawns.
    let cfg = EngineConfig::from_env()?;
    let data = DataProcessor::from_path(&cfg)?;
    let executor = Arc::new(SocketExecutor::connect(cfg.infer_port)?);

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(9904);

    let engine = Engine::start(cfg, data, executor)?;
    let state = AppState::new(engine);
    let app = api::create_router(state);

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
