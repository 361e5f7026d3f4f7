//! Call driver: one task that owns the negotiator and feeds it everything.

use std::future::pending;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::engine::{PeerEvent, RtcEngine, TrackInfo};
use crate::negotiator::{NegotiationError, Negotiator, NegotiatorEvent, NegotiatorState, Role};
use crate::signaling::{ChannelEvent, ChannelLink};

pub const NO_REMOTE_STREAM: &str = "No Remote Stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallCommand {
    /// What the single call button does: start when ready, end when in a call.
    Toggle,
    StartCall,
    EndCall,
    Shutdown,
}

/// Snapshot published after every event the driver handles.
#[derive(Debug, Clone, PartialEq)]
pub struct CallStatus {
    pub state: NegotiatorState,
    pub role: Option<Role>,
    pub local_tracks: Vec<TrackInfo>,
    pub remote_tracks: Vec<TrackInfo>,
    pub channel_connected: bool,
    pub last_error: Option<String>,
}

impl Default for CallStatus {
    fn default() -> Self {
        Self {
            state: NegotiatorState::Idle,
            role: None,
            local_tracks: Vec::new(),
            remote_tracks: Vec::new(),
            channel_connected: false,
            last_error: None,
        }
    }
}

impl CallStatus {
    pub fn local_surface(&self) -> String {
        surface(&self.local_tracks).unwrap_or_else(|| "No Local Stream".to_owned())
    }

    pub fn remote_surface(&self) -> String {
        surface(&self.remote_tracks).unwrap_or_else(|| NO_REMOTE_STREAM.to_owned())
    }

    pub fn toggle_label(&self) -> &'static str {
        if self.state.in_call() {
            "End Call"
        } else {
            "Start Call"
        }
    }
}

fn surface(tracks: &[TrackInfo]) -> Option<String> {
    if tracks.is_empty() {
        return None;
    }
    let names: Vec<String> = tracks
        .iter()
        .map(|t| format!("{}:{}", t.kind, t.id))
        .collect();
    Some(names.join(" "))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionConfig {
    /// Abandon a call whose descriptions have not settled within this long.
    pub negotiation_timeout: Option<Duration>,
}

/// What the UI holds on to.
pub struct SessionHandle {
    pub commands: mpsc::UnboundedSender<CallCommand>,
    pub status: watch::Receiver<CallStatus>,
}

pub struct CallSession<E: RtcEngine> {
    negotiator: Negotiator<E>,
    engine_events: mpsc::UnboundedReceiver<PeerEvent>,
    link: ChannelLink,
    link_open: bool,
    commands: mpsc::UnboundedReceiver<CallCommand>,
    status: watch::Sender<CallStatus>,
    config: SessionConfig,
    deadline: Option<Instant>,
    last_error: Option<String>,
}

impl<E: RtcEngine> CallSession<E> {
    pub fn new(engine: E, link: ChannelLink, config: SessionConfig) -> (Self, SessionHandle) {
        let (negotiator, engine_events) = Negotiator::new(engine);
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(CallStatus::default());
        let session = Self {
            negotiator,
            engine_events,
            link,
            link_open: true,
            commands,
            status,
            config,
            deadline: None,
            last_error: None,
        };
        let handle = SessionHandle {
            commands: commands_tx,
            status: status_rx,
        };
        (session, handle)
    }

    /// Runs until [`CallCommand::Shutdown`] or until every command sender is
    /// gone. Fails only if local media cannot be acquired at startup.
    pub async fn run(mut self) -> Result<(), NegotiationError> {
        if let Err(err) = self.negotiator.handle_event(NegotiatorEvent::Start).await {
            warn!(error = %err, "could not start endpoint");
            self.last_error = Some(err.to_string());
            self.publish();
            return Err(err);
        }
        self.publish();

        loop {
            let deadline = self.deadline;
            let timer = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => pending::<()>().await,
                }
            };

            tokio::select! {
                command = self.commands.recv() => {
                    let command = command.unwrap_or(CallCommand::Shutdown);
                    if !self.on_command(command).await {
                        break;
                    }
                }
                event = self.link.recv(), if self.link_open => self.on_channel(event).await,
                Some(event) = self.engine_events.recv() => {
                    self.dispatch(NegotiatorEvent::Engine(event)).await;
                }
                _ = timer => {
                    self.deadline = None;
                    self.dispatch(NegotiatorEvent::NegotiationTimedOut).await;
                }
            }

            self.settle().await;
            self.publish();
        }

        self.dispatch(NegotiatorEvent::EndCall).await;
        self.publish();
        info!("call session stopped");
        Ok(())
    }

    async fn on_command(&mut self, command: CallCommand) -> bool {
        debug!(?command, state = %self.negotiator.state(), "call command");
        match command {
            CallCommand::Toggle => {
                let state = self.negotiator.state();
                if state == NegotiatorState::Ready {
                    self.dispatch(NegotiatorEvent::StartCall).await;
                } else if state.in_call() {
                    self.dispatch(NegotiatorEvent::EndCall).await;
                } else {
                    debug!(%state, "toggle ignored");
                }
            }
            CallCommand::StartCall => self.dispatch(NegotiatorEvent::StartCall).await,
            CallCommand::EndCall => self.dispatch(NegotiatorEvent::EndCall).await,
            CallCommand::Shutdown => return false,
        }
        true
    }

    async fn on_channel(&mut self, event: Option<ChannelEvent>) {
        match event {
            Some(ChannelEvent::Connected) => {
                self.dispatch(NegotiatorEvent::ChannelReconnected).await;
            }
            Some(ChannelEvent::Frame(frame)) => {
                self.dispatch(NegotiatorEvent::Signal(frame)).await;
            }
            Some(ChannelEvent::Disconnected(reason)) => {
                debug!(%reason, "relay channel down");
                self.dispatch(NegotiatorEvent::ChannelDisconnected).await;
            }
            None => {
                warn!("relay channel closed for good");
                self.link_open = false;
                self.dispatch(NegotiatorEvent::ChannelDisconnected).await;
            }
        }
    }

    async fn dispatch(&mut self, event: NegotiatorEvent) {
        match self.negotiator.handle_event(event).await {
            Ok(transition) => {
                for frame in transition.outbound {
                    let event = frame.event;
                    if self.link.send(frame).is_err() {
                        let err = NegotiationError::ChannelDisconnected;
                        warn!(%event, error = %err, "outbound frame dropped");
                        self.last_error = Some(err.to_string());
                    }
                }
            }
            Err(err) => {
                warn!(state = %self.negotiator.state(), error = %err, "negotiation event rejected");
                self.last_error = Some(err.to_string());
            }
        }
    }

    /// Re-arms the endpoint after a call ends and keeps the timer in step
    /// with the negotiation phase.
    async fn settle(&mut self) {
        if self.negotiator.state() == NegotiatorState::Closed {
            info!("call ended; preparing for the next one");
            self.dispatch(NegotiatorEvent::Start).await;
        }

        let negotiating = self.negotiator.state().is_negotiating();
        match (negotiating, self.deadline, self.config.negotiation_timeout) {
            (true, None, Some(timeout)) => self.deadline = Some(Instant::now() + timeout),
            (false, Some(_), _) => self.deadline = None,
            _ => {}
        }
    }

    fn publish(&self) {
        let status = CallStatus {
            state: self.negotiator.state(),
            role: self.negotiator.role(),
            local_tracks: self.negotiator.local_tracks(),
            remote_tracks: self.negotiator.remote_tracks(),
            channel_connected: self.negotiator.is_channel_connected(),
            last_error: self.last_error.clone(),
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}
