use clap::Args;
use std::time::Duration;
use thiserror::Error;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::engine::webrtc::MediaConstraints;
use crate::signaling::{
    ChannelError, DEFAULT_RECONNECT_ATTEMPTS, ReconnectPolicy, relay_endpoint,
};

pub const DEFAULT_RELAY_URL: &str = "ws://localhost:3000/ws";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Endpoint settings shared by every `parley` invocation.
#[derive(Args, Debug, Clone)]
pub struct EndpointArgs {
    /// Relay WebSocket URL (`host:port` is accepted too)
    #[arg(long, env = "PARLEY_RELAY_URL", default_value = DEFAULT_RELAY_URL)]
    pub relay: String,

    /// Comma-separated STUN/TURN URLs; replaces the default STUN server
    #[arg(long, env = "PARLEY_ICE_SERVERS", value_delimiter = ',')]
    pub ice_servers: Vec<String>,

    /// Skip STUN entirely (both endpoints on one host or LAN)
    #[arg(long, env = "PARLEY_LOCALHOST_ONLY")]
    pub localhost_only: bool,

    #[arg(long)]
    pub no_audio: bool,

    #[arg(long)]
    pub no_video: bool,

    /// End a call whose offer/answer exchange has not settled in time
    #[arg(long, env = "PARLEY_NEGOTIATION_TIMEOUT_SECS")]
    pub negotiation_timeout_secs: Option<u64>,

    #[arg(long, env = "PARLEY_RECONNECT_ATTEMPTS", default_value_t = DEFAULT_RECONNECT_ATTEMPTS)]
    pub reconnect_attempts: u32,

    #[arg(long, env = "PARLEY_RECONNECT_DELAY_MS", default_value_t = 1000)]
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Relay(#[from] ChannelError),
    #[error("both audio and video are disabled; nothing to send")]
    NoMedia,
    #[error("negotiation timeout must be at least one second")]
    ZeroTimeout,
    #[error("invalid ICE server `{0}`")]
    IceServer(String),
}

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub relay_url: String,
    pub ice_servers: Vec<RTCIceServer>,
    pub constraints: MediaConstraints,
    pub negotiation_timeout: Option<Duration>,
    pub reconnect: ReconnectPolicy,
}

impl TryFrom<EndpointArgs> for EndpointConfig {
    type Error = ConfigError;

    fn try_from(args: EndpointArgs) -> Result<Self, ConfigError> {
        let relay_url = relay_endpoint(&args.relay)?.to_string();

        let constraints = MediaConstraints {
            audio: !args.no_audio,
            video: !args.no_video,
        };
        if !constraints.audio && !constraints.video {
            return Err(ConfigError::NoMedia);
        }

        let negotiation_timeout = match args.negotiation_timeout_secs {
            Some(0) => return Err(ConfigError::ZeroTimeout),
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        };

        let ice_servers = if args.localhost_only {
            Vec::new()
        } else if args.ice_servers.is_empty() {
            vec![ice_server(DEFAULT_STUN_SERVER)?]
        } else {
            args.ice_servers
                .iter()
                .filter(|url| !url.trim().is_empty())
                .map(|url| ice_server(url))
                .collect::<Result<_, _>>()?
        };

        Ok(Self {
            relay_url,
            ice_servers,
            constraints,
            negotiation_timeout,
            reconnect: ReconnectPolicy {
                attempts: args.reconnect_attempts,
                delay: Duration::from_millis(args.reconnect_delay_ms),
            },
        })
    }
}

/// Accepts bare `host:port` as a STUN server.
fn ice_server(raw: &str) -> Result<RTCIceServer, ConfigError> {
    let raw = raw.trim();
    let known = ["stun:", "stuns:", "turn:", "turns:"];
    let url = if known.iter().any(|scheme| raw.starts_with(scheme)) {
        raw.to_owned()
    } else if raw.contains("://") || raw.is_empty() {
        return Err(ConfigError::IceServer(raw.to_owned()));
    } else {
        format!("stun:{raw}")
    };
    Ok(RTCIceServer {
        urls: vec![url],
        ..Default::default()
    })
}
