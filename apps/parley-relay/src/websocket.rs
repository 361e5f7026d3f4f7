use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::hub::{ChannelId, ChannelRole, Relay};
use crate::protocol::{self, FrameError};

/// Shared state handed to every connection.
#[derive(Clone)]
pub struct RelayState {
    pub relay: Relay,
    pub config: Arc<RelayConfig>,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            relay: Relay::new(config.channel_buffer),
            config: Arc::new(config),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Join as a read-only observer (`/ws?observe=1`).
    #[serde(default, deserialize_with = "flag")]
    pub observe: bool,
}

fn flag<'de, D: serde::Deserializer<'de>>(de: D) -> Result<bool, D::Error> {
    let raw = String::deserialize(de)?;
    Ok(matches!(raw.as_str(), "" | "1" | "true" | "yes"))
}

impl ConnectParams {
    fn role(&self) -> ChannelRole {
        if self.observe {
            ChannelRole::Observer
        } else {
            ChannelRole::Endpoint
        }
    }
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
) -> Response {
    let role = params.role();
    if let (Some(max), ChannelRole::Endpoint) = (state.config.max_channels, role) {
        if state.relay.endpoints() >= max {
            warn!(%remote_addr, max, "refusing channel: relay is full");
            return (StatusCode::SERVICE_UNAVAILABLE, "relay is full").into_response();
        }
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr, role))
}

async fn handle_socket(
    socket: WebSocket,
    state: RelayState,
    remote_addr: SocketAddr,
    role: ChannelRole,
) {
    let channel = ChannelId::generate();
    // Another upgrade may have taken the last slot since the check above.
    let mut outbound = match state.relay.try_register(channel, role, state.config.max_channels) {
        Ok(rx) => rx,
        Err(err) => {
            warn!(%channel, %remote_addr, "closing channel: {err}");
            return;
        }
    };
    let (mut sender, mut receiver) = socket.split();

    info!(
        %channel,
        %remote_addr,
        ?role,
        channels = state.relay.len(),
        "A user connected"
    );

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sender.send(Message::Text(frame.to_string())).await.is_err() {
                break;
            }
        }
        debug!(%channel, "writer task ended");
    });

    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!(%channel, "websocket error: {}", e);
                break;
            }
        };
        if role == ChannelRole::Observer {
            match msg {
                Message::Close(_) => break,
                Message::Text(_) | Message::Binary(_) => {
                    debug!(%channel, "observer frame ignored")
                }
                Message::Ping(_) | Message::Pong(_) => {}
            }
            continue;
        }
        match msg {
            Message::Text(text) => relay_text(&state, channel, text),
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => relay_text(&state, channel, text),
                Err(_) => debug!(%channel, "ignoring non-UTF8 binary frame"),
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    state.relay.deregister(channel);
    writer.abort();
    info!(
        %channel,
        ?role,
        channels = state.relay.len(),
        "User disconnected"
    );

    if state.config.notify_peer_left && role == ChannelRole::Endpoint {
        let delivery = state
            .relay
            .broadcast_except(channel, protocol::peer_left_frame());
        debug!(%channel, notified = delivery.delivered, "peer-left broadcast");
    }
}

fn relay_text(state: &RelayState, channel: ChannelId, text: String) {
    match protocol::classify(&text) {
        Ok(event) => {
            let delivery = state.relay.broadcast_except(channel, Arc::from(text));
            info!(
                %channel,
                event = event.as_str(),
                delivered = delivery.delivered,
                dropped = delivery.dropped,
                "relayed frame"
            );
        }
        Err(FrameError::NotForwardable(event)) => {
            warn!(%channel, event = event.as_str(), "dropping relay-only event sent by endpoint");
        }
        Err(err) => {
            warn!(%channel, "dropping frame: {}", err);
        }
    }
}
