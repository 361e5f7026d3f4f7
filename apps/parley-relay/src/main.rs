mod cli;
mod config;
mod handlers;
mod hub;
mod protocol;
mod websocket;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::{
    cli::{Cli, Commands},
    config::RelayConfig,
    handlers::router,
    websocket::RelayState,
};

fn init_tracing() {
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter_layer)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();

    if let Some(Commands::Tap { url, count }) = cli.command {
        if let Err(e) = cli::run_tap(url, count).await {
            error!("tap error: {e:#}");
            std::process::exit(1);
        }
        return Ok(());
    }

    let config = RelayConfig::try_from(cli.serve)?;
    info!(
        listen_addr = %config.listen_addr,
        channel_buffer = config.channel_buffer,
        max_channels = ?config.max_channels,
        notify_peer_left = config.notify_peer_left,
        "starting parley relay"
    );

    let listen_addr = config.listen_addr;
    let app = router(RelayState::new(config));
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;

    info!("Signaling relay is running on {}", listen_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("relay shut down with error")?;

    info!("relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
