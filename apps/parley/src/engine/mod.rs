//! Seam between the negotiator and the real-time media engine.
//!
//! The negotiator drives an [`RtcEngine`] and never touches media or network
//! code directly. Asynchronous engine callbacks arrive as [`PeerEvent`]s on
//! the channel handed to [`RtcEngine::create_peer`], stamped with the
//! [`PeerId`] of the connection that raised them.

pub mod mock;
pub mod webrtc;

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{NetworkCandidate, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub kind: TrackKind,
    pub id: String,
}

impl TrackInfo {
    pub fn new(kind: TrackKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    LocalCandidate(NetworkCandidate),
    Connectivity(ConnectivityState),
    RemoteTrack(TrackInfo),
}

/// Identifies one peer connection for the lifetime of a negotiator. A new
/// id is issued every time a fresh connection is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    pub peer: PeerId,
    pub event: EngineEvent,
}

/// Callback sink handed to one peer connection.
#[derive(Debug, Clone)]
pub struct EngineEvents {
    peer: PeerId,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl EngineEvents {
    pub fn new(peer: PeerId, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self { peer, tx }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Returns `false` once nobody is listening.
    pub fn send(&self, event: EngineEvent) -> bool {
        self.tx
            .send(PeerEvent {
                peer: self.peer,
                event,
            })
            .is_ok()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("media capture failed: {0}")]
    Media(String),
    #[error("rtc operation failed: {0}")]
    Rtc(String),
    #[error("peer connection already closed")]
    Closed,
}

/// Captured local media. Dropping it without [`LocalMedia::stop`] leaves
/// capture running until the engine notices.
pub trait LocalMedia: Send + Sync {
    fn tracks(&self) -> Vec<TrackInfo>;
    fn stop(&mut self);
}

#[async_trait]
pub trait RtcPeer: Send {
    async fn create_offer(&mut self) -> Result<SessionDescription, EngineError>;
    async fn create_answer(&mut self) -> Result<SessionDescription, EngineError>;
    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<(), EngineError>;
    async fn set_remote_description(&mut self, desc: SessionDescription)
    -> Result<(), EngineError>;
    async fn add_ice_candidate(&mut self, candidate: NetworkCandidate) -> Result<(), EngineError>;
    async fn close(&mut self) -> Result<(), EngineError>;
}

#[async_trait]
pub trait RtcEngine: Send + Sync {
    type Media: LocalMedia;
    type Peer: RtcPeer;

    async fn acquire_media(&self) -> Result<Self::Media, EngineError>;

    /// Builds a peer with `media`'s tracks attached. Candidate, connectivity
    /// and remote-track callbacks are reported on `events`.
    async fn create_peer(
        &self,
        media: &Self::Media,
        events: EngineEvents,
    ) -> Result<Self::Peer, EngineError>;
}
