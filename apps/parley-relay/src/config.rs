use anyhow::{Context, Result};
use std::net::{IpAddr, SocketAddr};

use crate::cli::ServeArgs;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_CHANNEL_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    /// Capacity of each channel's outbound queue.
    pub channel_buffer: usize,
    /// Refuse endpoint upgrades once this many endpoints are connected.
    /// Observers are not counted.
    pub max_channels: Option<usize>,
    /// Broadcast `peer-left` when a channel disconnects.
    pub notify_peer_left: bool,
}

impl TryFrom<ServeArgs> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self> {
        let host: IpAddr = args
            .host
            .parse()
            .with_context(|| format!("invalid listen host: {}", args.host))?;
        let listen_addr = SocketAddr::new(host, args.port);
        if args.channel_buffer == 0 {
            anyhow::bail!("channel buffer must be at least 1");
        }
        Ok(Self {
            listen_addr,
            channel_buffer: args.channel_buffer,
            max_channels: args.max_channels.filter(|max| *max > 0),
            notify_peer_left: !args.no_peer_left,
        })
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            channel_buffer: DEFAULT_CHANNEL_BUFFER,
            max_channels: None,
            notify_peer_left: true,
        }
    }
}
