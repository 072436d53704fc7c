use std::path::PathBuf;
use std::sync::Arc;

use taleloom::config::EngineConfig;
use taleloom::engine::Engine;
use taleloom::jobs::OutboxPoller;
use taleloom::server;
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("taleloom.yaml"));
    let config = EngineConfig::load(Some(&config_path))?;
    let bind_addr = config.bind_addr.clone();

    let engine = Arc::new(Engine::new(config)?);
    OutboxPoller::spawn(engine.clone());

    let router = server::router(engine);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "taleloom server listening");
    axum::serve(listener, router).await?;
    Ok(())
}
