use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::StreamExt;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::config::{DEFAULT_CHANNEL_BUFFER, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(name = "parley-relay")]
#[command(about = "Parley signaling relay and debug tap")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Interface to bind
    #[arg(long, env = "RELAY_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Frames queued per channel before further frames to it are dropped
    #[arg(long, env = "RELAY_CHANNEL_BUFFER", default_value_t = DEFAULT_CHANNEL_BUFFER)]
    pub channel_buffer: usize,

    /// Refuse new endpoint channels beyond this count (0 or unset: unlimited)
    #[arg(long, env = "RELAY_MAX_CHANNELS")]
    pub max_channels: Option<usize>,

    /// Do not tell remaining channels when one disconnects
    #[arg(long)]
    pub no_peer_left: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join a relay as an observer and print every frame it fans out
    Tap {
        /// Relay WebSocket URL
        #[arg(short, long, default_value = "ws://127.0.0.1:3000/ws")]
        url: String,

        /// Exit after this many frames
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },
}

pub async fn run_tap(url: String, count: Option<usize>) -> Result<()> {
    let url = observer_url(&url);
    debug!("tapping relay at {}", url);

    let (ws_stream, _) = timeout(Duration::from_secs(5), connect_async(url.as_str()))
        .await
        .map_err(|_| anyhow::anyhow!("connection timeout - is the relay running?"))?
        .with_context(|| format!("failed to connect to {url}"))?;
    let (_write, mut read) = ws_stream.split();

    let mut seen = 0usize;
    while let Some(msg) = read.next().await {
        match msg? {
            Message::Text(text) => {
                println!("{}", render_frame(text.as_str()));
                seen += 1;
            }
            Message::Close(_) => break,
            _ => continue,
        }
        if count.is_some_and(|limit| seen >= limit) {
            break;
        }
    }
    Ok(())
}

/// Marks the connection as an observer so the tap neither counts towards the
/// channel cap nor triggers `peer-left` when it exits.
fn observer_url(url: &str) -> String {
    if url.contains("observe=") {
        url.to_owned()
    } else if url.contains('?') {
        format!("{url}&observe=1")
    } else {
        format!("{url}?observe=1")
    }
}

fn render_frame(text: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) => {
            let event = value
                .get("event")
                .and_then(|event| event.as_str())
                .unwrap_or("?");
            let data = value.get("data").cloned().unwrap_or_default();
            format!("[{event}] {data}")
        }
        Err(_) => format!("[raw] {text}"),
    }
}
