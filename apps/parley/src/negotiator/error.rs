use thiserror::Error;

use crate::engine::EngineError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("local media unavailable: {0}")]
    MediaUnavailable(String),
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("invalid network candidate: {0}")]
    InvalidCandidate(String),
    #[error("relay channel disconnected")]
    ChannelDisconnected,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("not ready: {0}")]
    NotReady(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
}
