pub mod config;
pub mod engine;
pub mod negotiator;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod telemetry;

pub use negotiator::{
    NegotiationError, Negotiator, NegotiatorEvent, NegotiatorState, Role, Transition,
};
pub use session::{CallCommand, CallSession, CallStatus, SessionConfig, SessionHandle};
