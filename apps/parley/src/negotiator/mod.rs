//! Per-endpoint negotiation state machine.
//!
//! Everything that can happen to an endpoint arrives as a [`NegotiatorEvent`]
//! and is applied by [`Negotiator::handle_event`] on one task. The result is a
//! [`Transition`] carrying the frames to publish on the relay channel; the
//! negotiator itself never does I/O beyond engine calls.

mod error;
pub mod handle;

pub use error::NegotiationError;
pub use handle::{CandidateDisposition, ConnectionHandle, FlushReport, HandlePhase};

use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::{
    ConnectivityState, EngineEvent, EngineEvents, LocalMedia, PeerEvent, PeerId, RtcEngine,
    TrackInfo,
};
use crate::protocol::{NetworkCandidate, RelayFrame, SessionDescription, SignalMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiatorState {
    Idle,
    GatheringMedia,
    Ready,
    OfferSent,
    OfferReceived,
    AnswerExchanged,
    Established,
    Closed,
}

impl NegotiatorState {
    pub fn as_str(self) -> &'static str {
        match self {
            NegotiatorState::Idle => "idle",
            NegotiatorState::GatheringMedia => "gathering-media",
            NegotiatorState::Ready => "ready",
            NegotiatorState::OfferSent => "offer-sent",
            NegotiatorState::OfferReceived => "offer-received",
            NegotiatorState::AnswerExchanged => "answer-exchanged",
            NegotiatorState::Established => "established",
            NegotiatorState::Closed => "closed",
        }
    }

    /// Descriptions are in flight but media is not yet flowing.
    pub fn is_negotiating(self) -> bool {
        matches!(
            self,
            NegotiatorState::OfferSent
                | NegotiatorState::OfferReceived
                | NegotiatorState::AnswerExchanged
        )
    }

    pub fn in_call(self) -> bool {
        self.is_negotiating() || self == NegotiatorState::Established
    }
}

impl fmt::Display for NegotiatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NegotiatorEvent {
    Start,
    StartCall,
    EndCall,
    Signal(RelayFrame),
    Engine(PeerEvent),
    ChannelDisconnected,
    ChannelReconnected,
    NegotiationTimedOut,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: NegotiatorState,
    pub to: NegotiatorState,
    pub outbound: Vec<RelayFrame>,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

struct ActiveCall<E: RtcEngine> {
    peer: PeerId,
    media: E::Media,
    handle: ConnectionHandle<E::Peer>,
}

pub struct Negotiator<E: RtcEngine> {
    engine: E,
    events: mpsc::UnboundedSender<PeerEvent>,
    next_peer: u64,
    state: NegotiatorState,
    active: Option<ActiveCall<E>>,
    channel_connected: bool,
}

impl<E: RtcEngine> Negotiator<E> {
    /// Builds an idle negotiator. Engine callbacks for every peer it creates
    /// are delivered on the returned receiver; feed them back as
    /// [`NegotiatorEvent::Engine`]. Events from a peer that has since been
    /// replaced are dropped.
    pub fn new(engine: E) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let negotiator = Self {
            engine,
            events,
            next_peer: 0,
            state: NegotiatorState::Idle,
            active: None,
            channel_connected: false,
        };
        (negotiator, rx)
    }

    pub fn state(&self) -> NegotiatorState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.active.as_ref().and_then(|call| call.handle.role())
    }

    /// The connection whose engine events are currently accepted.
    pub fn peer_id(&self) -> Option<PeerId> {
        self.active.as_ref().map(|call| call.peer)
    }

    pub fn handle(&self) -> Option<&ConnectionHandle<E::Peer>> {
        self.active.as_ref().map(|call| &call.handle)
    }

    pub fn local_tracks(&self) -> Vec<TrackInfo> {
        self.handle()
            .map(|h| h.local_tracks().to_vec())
            .unwrap_or_default()
    }

    pub fn remote_tracks(&self) -> Vec<TrackInfo> {
        self.handle()
            .map(|h| h.remote_tracks().to_vec())
            .unwrap_or_default()
    }

    pub fn is_channel_connected(&self) -> bool {
        self.channel_connected
    }

    /// Applies one event. A rejected event leaves the state where it was
    /// unless the failure happened part way through an accepted offer.
    pub async fn handle_event(
        &mut self,
        event: NegotiatorEvent,
    ) -> Result<Transition, NegotiationError> {
        let from = self.state;
        let mut outbound = Vec::new();
        match event {
            NegotiatorEvent::Start => self.start().await?,
            NegotiatorEvent::StartCall => self.start_call(&mut outbound).await?,
            NegotiatorEvent::EndCall => self.end_call().await,
            NegotiatorEvent::Signal(frame) => self.on_signal(frame, &mut outbound).await?,
            NegotiatorEvent::Engine(event) => self.on_engine(event, &mut outbound),
            NegotiatorEvent::ChannelDisconnected => {
                if self.channel_connected {
                    warn!(state = %self.state, "relay channel lost; negotiation parked");
                }
                self.channel_connected = false;
            }
            NegotiatorEvent::ChannelReconnected => {
                info!(state = %self.state, "relay channel up");
                self.channel_connected = true;
            }
            NegotiatorEvent::NegotiationTimedOut => {
                if self.state.is_negotiating() {
                    warn!(state = %self.state, "negotiation timed out; ending call");
                    self.end_call().await;
                } else {
                    debug!(state = %self.state, "stale negotiation timeout ignored");
                }
            }
        }
        Ok(Transition {
            from,
            to: self.state,
            outbound,
        })
    }

    async fn start(&mut self) -> Result<(), NegotiationError> {
        let resume = self.state;
        if !matches!(resume, NegotiatorState::Idle | NegotiatorState::Closed) {
            return Err(NegotiationError::ProtocolViolation(format!(
                "start requested while {resume}"
            )));
        }
        self.set_state(NegotiatorState::GatheringMedia);

        let mut media = match self.engine.acquire_media().await {
            Ok(media) => media,
            Err(err) => {
                self.set_state(resume);
                return Err(NegotiationError::MediaUnavailable(err.to_string()));
            }
        };
        let id = PeerId(self.next_peer);
        self.next_peer += 1;
        let sink = EngineEvents::new(id, self.events.clone());
        let peer = match self.engine.create_peer(&media, sink).await {
            Ok(peer) => peer,
            Err(err) => {
                media.stop();
                self.set_state(resume);
                return Err(err.into());
            }
        };
        let handle = ConnectionHandle::new(peer, media.tracks());
        debug!(peer = %id, "peer connection ready");
        self.active = Some(ActiveCall {
            peer: id,
            media,
            handle,
        });
        self.set_state(NegotiatorState::Ready);
        Ok(())
    }

    async fn start_call(&mut self, outbound: &mut Vec<RelayFrame>) -> Result<(), NegotiationError> {
        if self.state != NegotiatorState::Ready {
            return Err(self.not_ready_or_violation("call"));
        }
        let handle = self.handle_mut()?;
        let offer = handle.create_offer().await?;
        handle.set_local_description(offer.clone()).await?;
        outbound.push(SignalMessage::Offer(offer).into_frame());
        self.set_state(NegotiatorState::OfferSent);
        Ok(())
    }

    async fn end_call(&mut self) {
        let Some(mut call) = self.active.take() else {
            if self.state != NegotiatorState::Closed {
                debug!(state = %self.state, "end call ignored: no active call");
            }
            return;
        };
        if let Err(err) = call.handle.close().await {
            warn!(error = %err, "peer connection did not close cleanly");
        }
        call.media.stop();
        self.set_state(NegotiatorState::Closed);
    }

    async fn on_signal(
        &mut self,
        frame: RelayFrame,
        outbound: &mut Vec<RelayFrame>,
    ) -> Result<(), NegotiationError> {
        match SignalMessage::try_from(frame)? {
            SignalMessage::Offer(offer) => self.accept_offer(offer, outbound).await,
            SignalMessage::Answer(answer) => self.accept_answer(answer).await,
            SignalMessage::IceCandidate(candidate) => self.accept_candidate(candidate).await,
            SignalMessage::PeerLeft => {
                if self.state.in_call() {
                    info!(state = %self.state, "remote peer left; ending call");
                    self.end_call().await;
                } else {
                    debug!(state = %self.state, "peer-left outside a call ignored");
                }
                Ok(())
            }
        }
    }

    async fn accept_offer(
        &mut self,
        offer: SessionDescription,
        outbound: &mut Vec<RelayFrame>,
    ) -> Result<(), NegotiationError> {
        if self.state != NegotiatorState::Ready {
            return Err(self.not_ready_or_violation("offer"));
        }
        let report = self.handle_mut()?.set_remote_description(offer).await?;
        self.set_state(NegotiatorState::OfferReceived);
        debug!(applied = report.applied, failed = report.failed, "remote offer committed");

        let handle = self.handle_mut()?;
        let answer = handle.create_answer().await?;
        handle.set_local_description(answer.clone()).await?;
        outbound.push(SignalMessage::Answer(answer).into_frame());
        self.set_state(NegotiatorState::AnswerExchanged);
        Ok(())
    }

    async fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        if self.state != NegotiatorState::OfferSent {
            return Err(self.not_ready_or_violation("answer"));
        }
        let report = self.handle_mut()?.set_remote_description(answer).await?;
        debug!(applied = report.applied, failed = report.failed, "remote answer committed");
        self.set_state(NegotiatorState::AnswerExchanged);
        Ok(())
    }

    async fn accept_candidate(&mut self, candidate: NetworkCandidate) -> Result<(), NegotiationError> {
        match self.handle_mut()?.add_remote_candidate(candidate).await? {
            CandidateDisposition::Buffered { queued } => {
                debug!(queued, "remote candidate buffered until remote description")
            }
            CandidateDisposition::Applied => debug!("remote candidate applied"),
        }
        Ok(())
    }

    fn on_engine(&mut self, PeerEvent { peer, event }: PeerEvent, outbound: &mut Vec<RelayFrame>) {
        let Some(call) = self.active.as_mut() else {
            debug!(%peer, ?event, "engine event without an active call dropped");
            return;
        };
        if call.peer != peer {
            debug!(%peer, current = %call.peer, ?event, "event from a retired peer dropped");
            return;
        }
        match event {
            EngineEvent::LocalCandidate(candidate) => {
                outbound.push(SignalMessage::IceCandidate(candidate).into_frame());
            }
            EngineEvent::Connectivity(ConnectivityState::Connected) => {
                if self.state == NegotiatorState::AnswerExchanged {
                    call.handle.mark_established();
                    self.set_state(NegotiatorState::Established);
                } else {
                    debug!(state = %self.state, "connectivity reported outside negotiation");
                }
            }
            EngineEvent::Connectivity(
                connectivity @ (ConnectivityState::Failed
                | ConnectivityState::Disconnected
                | ConnectivityState::Closed),
            ) => {
                warn!(state = %self.state, ?connectivity, "peer connectivity degraded");
            }
            EngineEvent::Connectivity(connectivity) => {
                debug!(state = %self.state, ?connectivity, "peer connectivity changed");
            }
            EngineEvent::RemoteTrack(track) => {
                info!(kind = %track.kind, id = %track.id, "remote track attached");
                call.handle.attach_remote_track(track);
            }
        }
    }

    fn handle_mut(&mut self) -> Result<&mut ConnectionHandle<E::Peer>, NegotiationError> {
        let state = self.state;
        self.active
            .as_mut()
            .map(|call| &mut call.handle)
            .ok_or_else(|| NegotiationError::NotReady(format!("no peer connection while {state}")))
    }

    fn not_ready_or_violation(&self, what: &str) -> NegotiationError {
        if self.active.is_none() {
            NegotiationError::NotReady(format!("{what} while {}", self.state))
        } else {
            NegotiationError::ProtocolViolation(format!("{what} while {}", self.state))
        }
    }

    fn set_state(&mut self, next: NegotiatorState) {
        if self.state != next {
            info!(from = %self.state, to = %next, "negotiator transition");
            self.state = next;
        }
    }
}
