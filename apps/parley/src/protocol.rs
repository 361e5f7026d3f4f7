//! Wire format spoken over the relay channel.
//!
//! Every WebSocket text frame is an envelope `{"event": <name>, "data": <payload>}`.
//! The relay routes on `event` only; `data` is interpreted here, on the endpoints.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use crate::negotiator::NegotiationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Offer,
    Answer,
    IceCandidate,
    PeerLeft,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Offer => "offer",
            EventKind::Answer => "answer",
            EventKind::IceCandidate => "ice-candidate",
            EventKind::PeerLeft => "peer-left",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One relay frame before its payload has been validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayFrame {
    pub event: EventKind,
    #[serde(default)]
    pub data: Value,
}

impl RelayFrame {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An offer or answer. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A connectivity candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl NetworkCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

/// A validated negotiation message.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalMessage {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(NetworkCandidate),
    PeerLeft,
}

impl SignalMessage {
    pub fn event(&self) -> EventKind {
        match self {
            SignalMessage::Offer(_) => EventKind::Offer,
            SignalMessage::Answer(_) => EventKind::Answer,
            SignalMessage::IceCandidate(_) => EventKind::IceCandidate,
            SignalMessage::PeerLeft => EventKind::PeerLeft,
        }
    }

    pub fn into_frame(self) -> RelayFrame {
        let event = self.event();
        let data = match self {
            SignalMessage::Offer(desc) | SignalMessage::Answer(desc) => {
                json!({ "type": desc.kind.as_str(), "sdp": desc.sdp })
            }
            SignalMessage::IceCandidate(candidate) => json!({ "candidate": candidate }),
            SignalMessage::PeerLeft => json!({}),
        };
        RelayFrame { event, data }
    }
}

impl TryFrom<RelayFrame> for SignalMessage {
    type Error = NegotiationError;

    fn try_from(frame: RelayFrame) -> Result<Self, Self::Error> {
        match frame.event {
            EventKind::Offer => parse_description(SdpKind::Offer, &frame.data).map(SignalMessage::Offer),
            EventKind::Answer => {
                parse_description(SdpKind::Answer, &frame.data).map(SignalMessage::Answer)
            }
            EventKind::IceCandidate => parse_candidate(frame.data).map(SignalMessage::IceCandidate),
            EventKind::PeerLeft => Ok(SignalMessage::PeerLeft),
        }
    }
}

fn parse_description(expected: SdpKind, data: &Value) -> Result<SessionDescription, NegotiationError> {
    let invalid = |reason: String| NegotiationError::InvalidDescription(reason);

    let object = data
        .as_object()
        .ok_or_else(|| invalid(format!("{expected} payload is not an object")))?;
    let kind = non_empty_str(object.get("type"))
        .ok_or_else(|| invalid(format!("{expected} payload has no `type`")))?;
    let sdp = non_empty_str(object.get("sdp"))
        .ok_or_else(|| invalid(format!("{expected} payload has no `sdp`")))?;

    let kind = match kind {
        "offer" => SdpKind::Offer,
        "answer" => SdpKind::Answer,
        other => return Err(invalid(format!("unknown description type `{other}`"))),
    };
    if kind != expected {
        return Err(invalid(format!("{kind} description sent as {expected}")));
    }
    Ok(SessionDescription {
        kind,
        sdp: sdp.to_owned(),
    })
}

fn parse_candidate(mut data: Value) -> Result<NetworkCandidate, NegotiationError> {
    let raw = data
        .get_mut("candidate")
        .map(Value::take)
        .ok_or_else(|| NegotiationError::InvalidCandidate("payload has no `candidate`".into()))?;
    let candidate: NetworkCandidate = serde_json::from_value(raw)
        .map_err(|err| NegotiationError::InvalidCandidate(err.to_string()))?;
    if candidate.candidate.trim().is_empty() {
        return Err(NegotiationError::InvalidCandidate(
            "empty candidate line".into(),
        ));
    }
    Ok(candidate)
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .filter(|text| !text.trim().is_empty())
}
