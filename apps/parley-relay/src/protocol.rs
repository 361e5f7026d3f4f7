use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Event names carried in the `event` field of every relay frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelayEvent {
    Offer,
    Answer,
    IceCandidate,
    /// Emitted by the relay itself when a channel goes away.
    PeerLeft,
}

impl RelayEvent {
    /// Only negotiation events travel between endpoints.
    pub fn is_forwardable(self) -> bool {
        !matches!(self, RelayEvent::PeerLeft)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RelayEvent::Offer => "offer",
            RelayEvent::Answer => "answer",
            RelayEvent::IceCandidate => "ice-candidate",
            RelayEvent::PeerLeft => "peer-left",
        }
    }
}

// `data` is never parsed here; routing looks at the event name only.
#[derive(Debug, Deserialize)]
struct Envelope {
    event: RelayEvent,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed relay frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("event `{}` may not be sent by endpoints", .0.as_str())]
    NotForwardable(RelayEvent),
}

/// Reads the routing event of a text frame and checks it may be fanned out.
pub fn classify(text: &str) -> Result<RelayEvent, FrameError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    if !envelope.event.is_forwardable() {
        return Err(FrameError::NotForwardable(envelope.event));
    }
    Ok(envelope.event)
}

pub fn peer_left_frame() -> Arc<str> {
    Arc::from(r#"{"event":"peer-left","data":{}}"#)
}
