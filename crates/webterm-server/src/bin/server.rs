use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use webterm_server::{build_router, AppState};

#[derive(Parser, Debug)]
#[command(name = "webtermd", author, version, about = "WebSocket PTY session server")]
struct Options {
    /// Address the server binds to
    #[arg(long, default_value = "127.0.0.1", env = "WEBTERM_HOST")]
    host: String,
    /// Port to listen on
    #[arg(long, default_value_t = 8080, env = "WEBTERM_PORT")]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let state = AppState::new();
    let app = build_router(state.clone());

    let addr = format!("{}:{}", options.host, options.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!("webtermd listening on http://{addr}");
    info!("terminal endpoint: ws://{addr}/ws/terminal");

    // Graceful shutdown: drain every session first so the open WebSocket
    // connections end and axum's shutdown can complete.
    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown signal received; draining sessions");
            shutdown_state.registry.shutdown_all().await;
        })
        .await
        .context("server error")?;

    info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for shutdown signal");
    }
}
