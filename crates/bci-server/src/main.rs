//! BCI server - acquisition session with WebSocket subscribers
//!
//! Usage: `bci-server [config.json]`

use anyhow::Context;
use bci_server::{router, ServerConfig, Session};
use std::future::IntoFuture;
use std::path::Path;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn load_config(path: Option<&Path>) -> anyhow::Result<ServerConfig> {
    let Some(path) = path else {
        info!("No configuration file given, using defaults");
        return Ok(ServerConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading configuration {}", path.display()))?;
    ServerConfig::from_json(&text).with_context(|| format!("loading configuration {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = std::env::args().nth(1);
    let config = load_config(path.as_deref().map(Path::new))?;

    let session = Session::start(&config).await.context("starting acquisition session")?;

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    info!("Serving subscribers on ws://{}/ws", config.bind);

    let shutdown = session.shutdown_token();
    let server = tokio::spawn(
        axum::serve(listener, router(session.app_state()))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .into_future(),
    );

    tokio::select! {
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => info!("Interrupted, shutting down"),
            Err(e) => warn!("Cannot listen for interrupts ({}), shutting down", e),
        },
        _ = session.device.stopped() => warn!("Device stopped, shutting down"),
    }

    let ended = session.shutdown().await;
    server.await.context("server task")?.context("serving subscribers")?;
    ended.context("acquisition session ended with an error")?;
    Ok(())
}
