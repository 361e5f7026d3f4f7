//! In-memory engine used by tests and by the driver's own test suite.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use super::{
    EngineError, EngineEvent, EngineEvents, LocalMedia, RtcEngine, RtcPeer, TrackInfo, TrackKind,
};
use crate::protocol::{NetworkCandidate, SessionDescription};

#[derive(Default)]
struct Shared {
    fail_media: bool,
    fail_offer: bool,
    rejected_marker: Option<String>,
    peers_created: usize,
    peers_closed: usize,
    media_stopped: usize,
    local: Vec<SessionDescription>,
    remote: Vec<SessionDescription>,
    applied: Vec<NetworkCandidate>,
    events: Option<EngineEvents>,
}

/// Cloning shares the recorded state, so a test can keep a clone after
/// handing the engine to a negotiator.
#[derive(Clone)]
pub struct MockEngine {
    label: Arc<str>,
    shared: Arc<Mutex<Shared>>,
}

impl MockEngine {
    pub fn new(label: &str) -> Self {
        Self {
            label: Arc::from(label),
            shared: Arc::default(),
        }
    }

    pub fn failing_media(label: &str) -> Self {
        let engine = Self::new(label);
        engine.shared.lock().fail_media = true;
        engine
    }

    pub fn fail_offers(&self) {
        self.shared.lock().fail_offer = true;
    }

    /// Candidates whose line contains `marker` fail to apply.
    pub fn reject_candidates_containing(&self, marker: &str) {
        self.shared.lock().rejected_marker = Some(marker.to_owned());
    }

    /// Feeds an event through the most recently created peer's callbacks.
    pub fn emit(&self, event: EngineEvent) -> bool {
        match &self.shared.lock().events {
            Some(events) => events.send(event),
            None => false,
        }
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.shared
            .lock()
            .applied
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub fn local_descriptions(&self) -> Vec<SessionDescription> {
        self.shared.lock().local.clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.shared.lock().remote.clone()
    }

    pub fn peers_created(&self) -> usize {
        self.shared.lock().peers_created
    }

    pub fn peers_closed(&self) -> usize {
        self.shared.lock().peers_closed
    }

    pub fn media_stopped(&self) -> usize {
        self.shared.lock().media_stopped
    }
}

pub struct MockMedia {
    tracks: Vec<TrackInfo>,
    stopped: bool,
    shared: Arc<Mutex<Shared>>,
}

impl LocalMedia for MockMedia {
    fn tracks(&self) -> Vec<TrackInfo> {
        if self.stopped {
            Vec::new()
        } else {
            self.tracks.clone()
        }
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.shared.lock().media_stopped += 1;
        }
    }
}

pub struct MockPeer {
    label: Arc<str>,
    serial: usize,
    closed: bool,
    shared: Arc<Mutex<Shared>>,
}

impl MockPeer {
    fn sdp(&self, kind: &str) -> String {
        format!(
            "v=0\r\no=mock-{} {} 0 IN IP4 127.0.0.1\r\ns={kind}\r\n",
            self.label, self.serial
        )
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RtcPeer for MockPeer {
    async fn create_offer(&mut self) -> Result<SessionDescription, EngineError> {
        self.ensure_open()?;
        if self.shared.lock().fail_offer {
            return Err(EngineError::Rtc("offer generation failed".into()));
        }
        Ok(SessionDescription::offer(self.sdp("offer")))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, EngineError> {
        self.ensure_open()?;
        Ok(SessionDescription::answer(self.sdp("answer")))
    }

    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.shared.lock().local.push(desc);
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), EngineError> {
        self.ensure_open()?;
        if !desc.sdp.starts_with("v=0") {
            return Err(EngineError::Rtc("unparseable session description".into()));
        }
        self.shared.lock().remote.push(desc);
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: NetworkCandidate) -> Result<(), EngineError> {
        self.ensure_open()?;
        let mut shared = self.shared.lock();
        if let Some(marker) = &shared.rejected_marker {
            if candidate.candidate.contains(marker.as_str()) {
                return Err(EngineError::Rtc(format!(
                    "candidate rejected: {}",
                    candidate.candidate
                )));
            }
        }
        shared.applied.push(candidate);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        if !self.closed {
            self.closed = true;
            self.shared.lock().peers_closed += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl RtcEngine for MockEngine {
    type Media = MockMedia;
    type Peer = MockPeer;

    async fn acquire_media(&self) -> Result<MockMedia, EngineError> {
        if self.shared.lock().fail_media {
            return Err(EngineError::Media("camera permission denied".into()));
        }
        Ok(MockMedia {
            tracks: vec![
                TrackInfo::new(TrackKind::Audio, format!("{}-audio", self.label)),
                TrackInfo::new(TrackKind::Video, format!("{}-video", self.label)),
            ],
            stopped: false,
            shared: Arc::clone(&self.shared),
        })
    }

    async fn create_peer(
        &self,
        _media: &MockMedia,
        events: EngineEvents,
    ) -> Result<MockPeer, EngineError> {
        let mut shared = self.shared.lock();
        shared.peers_created += 1;
        shared.events = Some(events);
        Ok(MockPeer {
            label: Arc::clone(&self.label),
            serial: shared.peers_created,
            closed: false,
            shared: Arc::clone(&self.shared),
        })
    }
}
