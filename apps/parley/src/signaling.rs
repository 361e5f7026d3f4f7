//! WebSocket client for the relay.
//!
//! A supervisor task owns the socket. It reconnects on loss according to a
//! [`ReconnectPolicy`] and reports what happened as [`ChannelEvent`]s. The
//! relay keeps nothing for absent endpoints, so frames handed over while a
//! lost socket is down are dropped rather than replayed later. Frames queued
//! before the very first connection are held until it opens.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::protocol::RelayFrame;

pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts tolerated before giving up.
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RECONNECT_ATTEMPTS,
            delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Frame(RelayFrame),
    Disconnected(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("invalid relay url `{0}`")]
    InvalidUrl(String),
    #[error("relay channel closed")]
    Closed,
}

/// The endpoint's half of a relay channel.
pub struct ChannelLink {
    outbound: mpsc::UnboundedSender<RelayFrame>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    task: Option<JoinHandle<()>>,
}

/// The far side of [`ChannelLink::in_memory`].
pub struct LoopbackEnd {
    pub sent: mpsc::UnboundedReceiver<RelayFrame>,
    pub events: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelLink {
    /// A link backed by plain queues, for driving a session without a relay.
    pub fn in_memory() -> (Self, LoopbackEnd) {
        let (outbound, sent) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let link = Self {
            outbound,
            events,
            task: None,
        };
        (
            link,
            LoopbackEnd {
                sent,
                events: events_tx,
            },
        )
    }

    pub fn send(&self, frame: RelayFrame) -> Result<(), ChannelError> {
        self.outbound.send(frame).map_err(|_| ChannelError::Closed)
    }

    /// `None` once the supervisor has given up.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }
}

impl Drop for ChannelLink {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub struct RelayChannel;

impl RelayChannel {
    /// Starts the supervisor and returns immediately; the first
    /// [`ChannelEvent::Connected`] marks the socket as usable.
    pub fn connect(relay: &str, policy: ReconnectPolicy) -> Result<ChannelLink, ChannelError> {
        let url = relay_endpoint(relay)?;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let task = tokio::spawn(supervise(url, policy, outbound_rx, events_tx));
        Ok(ChannelLink {
            outbound,
            events,
            task: Some(task),
        })
    }
}

/// Accepts `host:port`, `ws://host:port` or a full `/ws` URL.
pub fn relay_endpoint(raw: &str) -> Result<Url, ChannelError> {
    let trimmed = raw.trim().trim_end_matches('/');
    let candidate = if trimmed.contains("://") {
        trimmed.to_owned()
    } else {
        format!("ws://{trimmed}")
    };
    let mut url = Url::parse(&candidate).map_err(|_| ChannelError::InvalidUrl(raw.to_owned()))?;
    match url.scheme() {
        "ws" | "wss" => {}
        "http" => url
            .set_scheme("ws")
            .map_err(|_| ChannelError::InvalidUrl(raw.to_owned()))?,
        "https" => url
            .set_scheme("wss")
            .map_err(|_| ChannelError::InvalidUrl(raw.to_owned()))?,
        _ => return Err(ChannelError::InvalidUrl(raw.to_owned())),
    }
    if url.host_str().is_none() {
        return Err(ChannelError::InvalidUrl(raw.to_owned()));
    }
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/ws");
    }
    Ok(url)
}

enum PumpExit {
    Lost(String),
    Shutdown,
}

async fn supervise(
    url: Url,
    policy: ReconnectPolicy,
    mut outbound: mpsc::UnboundedReceiver<RelayFrame>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    let mut failures = 0u32;
    let mut connected_before = false;
    loop {
        match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                failures = 0;
                if connected_before {
                    discard_stale(&mut outbound);
                }
                connected_before = true;
                info!(%url, "relay channel connected");
                if events.send(ChannelEvent::Connected).is_err() {
                    return;
                }
                match pump(stream, &mut outbound, &events).await {
                    PumpExit::Shutdown => return,
                    PumpExit::Lost(reason) => {
                        warn!(%url, %reason, "relay channel lost");
                        if events.send(ChannelEvent::Disconnected(reason)).is_err() {
                            return;
                        }
                    }
                }
            }
            Err(err) => {
                failures += 1;
                warn!(%url, attempt = failures, error = %err, "relay connection attempt failed");
                if failures > policy.attempts {
                    error!(%url, attempts = failures, "giving up on relay channel");
                    let _ = events.send(ChannelEvent::Disconnected(format!(
                        "gave up after {failures} attempts: {err}"
                    )));
                    return;
                }
            }
        }
        if !wait_out_delay(policy.delay, &mut outbound, !connected_before).await {
            return;
        }
    }
}

async fn pump(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    outbound: &mut mpsc::UnboundedReceiver<RelayFrame>,
    events: &mpsc::UnboundedSender<ChannelEvent>,
) -> PumpExit {
    let (mut ws_sender, mut ws_receiver) = stream.split();
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    return PumpExit::Shutdown;
                };
                match frame.encode() {
                    Ok(text) => {
                        if let Err(err) = ws_sender.send(Message::Text(text)).await {
                            return PumpExit::Lost(format!("send failed: {err}"));
                        }
                        debug!(event = %frame.event, "frame sent to relay");
                    }
                    Err(err) => warn!(event = %frame.event, error = %err, "could not encode frame"),
                }
            }
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if !deliver(&text, events) {
                        return PumpExit::Shutdown;
                    }
                }
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => {
                        if !deliver(text, events) {
                            return PumpExit::Shutdown;
                        }
                    }
                    Err(_) => debug!("ignoring non-UTF8 binary frame"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    return PumpExit::Lost("relay closed the connection".into());
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return PumpExit::Lost(err.to_string()),
            }
        }
    }
}

/// Returns false once nobody is listening any more.
fn deliver(text: &str, events: &mpsc::UnboundedSender<ChannelEvent>) -> bool {
    match RelayFrame::decode(text) {
        Ok(frame) => events.send(ChannelEvent::Frame(frame)).is_ok(),
        Err(err) => {
            warn!(error = %err, "skipping undecodable relay frame");
            true
        }
    }
}

fn discard_stale(outbound: &mut mpsc::UnboundedReceiver<RelayFrame>) {
    while let Ok(frame) = outbound.try_recv() {
        warn!(event = %frame.event, "dropping frame queued before reconnect");
    }
}

/// Sleeps out the retry delay. With `hold` set the outbound queue is left
/// alone; otherwise frames arriving meanwhile are dropped.
async fn wait_out_delay(
    delay: Duration,
    outbound: &mut mpsc::UnboundedReceiver<RelayFrame>,
    hold: bool,
) -> bool {
    if hold {
        tokio::time::sleep(delay).await;
        return true;
    }
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    warn!(event = %frame.event, "relay unreachable; dropping outbound frame");
                }
                None => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EventKind, SessionDescription, SignalMessage};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    #[test_timeout::timeout]
    fn endpoint_normalisation() {
        assert_eq!(
            relay_endpoint("localhost:3000").unwrap().as_str(),
            "ws://localhost:3000/ws"
        );
        assert_eq!(
            relay_endpoint("ws://relay.example:3000/").unwrap().as_str(),
            "ws://relay.example:3000/ws"
        );
        assert_eq!(
            relay_endpoint("https://relay.example/signal").unwrap().as_str(),
            "wss://relay.example/signal"
        );
        assert!(matches!(
            relay_endpoint("ftp://relay.example"),
            Err(ChannelError::InvalidUrl(_))
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn in_memory_link_passes_frames_both_ways() {
        let (mut link, mut far) = ChannelLink::in_memory();
        let frame = SignalMessage::Offer(SessionDescription::offer("v=0")).into_frame();
        link.send(frame.clone()).unwrap();
        assert_eq!(far.sent.recv().await, Some(frame.clone()));

        far.events.send(ChannelEvent::Frame(frame.clone())).unwrap();
        assert_eq!(link.recv().await, Some(ChannelEvent::Frame(frame)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn exchanges_frames_with_a_websocket_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::Text("not json".into())).await.unwrap();
            ws.send(Message::Text(r#"{"event":"peer-left","data":{}}"#.into()))
                .await
                .unwrap();
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => return text,
                    Some(Ok(_)) => continue,
                    other => panic!("unexpected {other:?}"),
                }
            }
        });

        let mut link = RelayChannel::connect(&format!("ws://{addr}/ws"), ReconnectPolicy::default())
            .unwrap();
        let wait = Duration::from_secs(5);
        assert_eq!(timeout(wait, link.recv()).await.unwrap(), Some(ChannelEvent::Connected));
        match timeout(wait, link.recv()).await.unwrap() {
            Some(ChannelEvent::Frame(frame)) => assert_eq!(frame.event, EventKind::PeerLeft),
            other => panic!("expected peer-left, got {other:?}"),
        }

        link.send(SignalMessage::Answer(SessionDescription::answer("v=0")).into_frame())
            .unwrap();
        let received = timeout(wait, server).await.unwrap().unwrap();
        let frame = RelayFrame::decode(&received).unwrap();
        assert_eq!(frame.event, EventKind::Answer);
        assert_eq!(frame.data["sdp"], "v=0");
    }

    #[test_timeout::tokio_timeout_test]
    async fn frames_queued_before_first_connect_survive_failed_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let policy = ReconnectPolicy {
            attempts: 50,
            delay: Duration::from_millis(50),
        };
        let mut link = RelayChannel::connect(&format!("ws://{addr}/ws"), policy).unwrap();
        link.send(SignalMessage::Offer(SessionDescription::offer("v=0\r\nearly")).into_frame())
            .unwrap();

        // Let a few attempts fail before the relay comes up.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let listener = TcpListener::bind(addr).await.unwrap();
        let wait = Duration::from_secs(5);
        let (tcp, _) = timeout(wait, listener.accept()).await.unwrap().unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        let text = loop {
            match timeout(wait, ws.next()).await.unwrap() {
                Some(Ok(Message::Text(text))) => break text,
                Some(Ok(_)) => continue,
                other => panic!("unexpected {other:?}"),
            }
        };
        let frame = RelayFrame::decode(&text).unwrap();
        assert_eq!(frame.event, EventKind::Offer);
        assert_eq!(frame.data["sdp"], "v=0\r\nearly");
        assert_eq!(timeout(wait, link.recv()).await.unwrap(), Some(ChannelEvent::Connected));
    }

    #[test_timeout::tokio_timeout_test]
    async fn gives_up_after_policy_is_exhausted() {
        // Reserve a port, then close it so every attempt is refused.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let policy = ReconnectPolicy {
            attempts: 2,
            delay: Duration::from_millis(10),
        };
        let mut link = RelayChannel::connect(&format!("ws://{addr}/ws"), policy).unwrap();
        link.send(SignalMessage::PeerLeft.into_frame()).unwrap();

        let wait = Duration::from_secs(5);
        match timeout(wait, link.recv()).await.unwrap() {
            Some(ChannelEvent::Disconnected(reason)) => assert!(reason.contains("3 attempts")),
            other => panic!("expected give-up, got {other:?}"),
        }
        assert_eq!(timeout(wait, link.recv()).await.unwrap(), None);
    }
}
