use std::collections::VecDeque;
use tracing::{debug, warn};

use super::{NegotiationError, Role};
use crate::engine::{EngineError, RtcPeer, TrackInfo};
use crate::protocol::{NetworkCandidate, SdpKind, SessionDescription};

/// Remote candidates held before the remote description. Past this the
/// oldest are discarded.
pub const MAX_PENDING_CANDIDATES: usize = 64;

/// Where a handle is in its single pass through negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlePhase {
    NoDescription,
    LocalOfferSet,
    RemoteDescriptionSet,
    Established,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Held until the remote description lands; `queued` includes this one.
    Buffered { queued: usize },
    Applied,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub applied: usize,
    pub failed: usize,
}

/// One peer-connection lifetime.
///
/// Each description slot is written at most once; a second write is a
/// protocol violation, never an overwrite. Remote candidates that arrive
/// before the remote description are buffered and applied in arrival order
/// the moment it is committed. A handle is never reused: ending a call drops
/// it and the next call gets a fresh one.
pub struct ConnectionHandle<P: RtcPeer> {
    peer: P,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    pending: VecDeque<NetworkCandidate>,
    discarded: usize,
    local_tracks: Vec<TrackInfo>,
    remote_tracks: Vec<TrackInfo>,
    established: bool,
    closed: bool,
}

impl<P: RtcPeer> ConnectionHandle<P> {
    pub fn new(peer: P, local_tracks: Vec<TrackInfo>) -> Self {
        Self {
            peer,
            local: None,
            remote: None,
            pending: VecDeque::new(),
            discarded: 0,
            local_tracks,
            remote_tracks: Vec::new(),
            established: false,
            closed: false,
        }
    }

    pub fn phase(&self) -> HandlePhase {
        if self.closed {
            HandlePhase::Closed
        } else if self.established {
            HandlePhase::Established
        } else if self.remote.is_some() {
            HandlePhase::RemoteDescriptionSet
        } else if self.local.is_some() {
            HandlePhase::LocalOfferSet
        } else {
            HandlePhase::NoDescription
        }
    }

    /// First committed offer decides the role.
    pub fn role(&self) -> Option<Role> {
        match (&self.local, &self.remote) {
            (Some(local), _) if local.kind == SdpKind::Offer => Some(Role::Caller),
            (_, Some(remote)) if remote.kind == SdpKind::Offer => Some(Role::Callee),
            _ => None,
        }
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote.as_ref()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    /// Buffered candidates evicted because the buffer was full.
    pub fn discarded_candidates(&self) -> usize {
        self.discarded
    }

    pub fn local_tracks(&self) -> &[TrackInfo] {
        &self.local_tracks
    }

    pub fn remote_tracks(&self) -> &[TrackInfo] {
        &self.remote_tracks
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        if self.local.is_some() || self.remote.is_some() {
            return Err(NegotiationError::ProtocolViolation(
                "offer requested after negotiation began".into(),
            ));
        }
        Ok(self.peer.create_offer().await?)
    }

    pub async fn create_answer(&mut self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        match &self.remote {
            Some(remote) if remote.kind == SdpKind::Offer => {}
            _ => {
                return Err(NegotiationError::ProtocolViolation(
                    "answer requested without a remote offer".into(),
                ));
            }
        }
        Ok(self.peer.create_answer().await?)
    }

    pub async fn set_local_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        if self.local.is_some() {
            return Err(NegotiationError::ProtocolViolation(
                "local description already set".into(),
            ));
        }
        let remote_offer = matches!(&self.remote, Some(r) if r.kind == SdpKind::Offer);
        match desc.kind {
            SdpKind::Offer if self.remote.is_some() => {
                return Err(NegotiationError::ProtocolViolation(
                    "local offer after a remote description".into(),
                ));
            }
            SdpKind::Answer if !remote_offer => {
                return Err(NegotiationError::ProtocolViolation(
                    "local answer without a remote offer".into(),
                ));
            }
            _ => {}
        }
        self.peer.set_local_description(desc.clone()).await?;
        self.local = Some(desc);
        Ok(())
    }

    /// Commits the remote description, then drains the candidate buffer.
    pub async fn set_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<FlushReport, NegotiationError> {
        self.ensure_open()?;
        if self.remote.is_some() {
            return Err(NegotiationError::ProtocolViolation(
                "remote description already set".into(),
            ));
        }
        let local_offer = matches!(&self.local, Some(l) if l.kind == SdpKind::Offer);
        match desc.kind {
            SdpKind::Offer if self.local.is_some() => {
                return Err(NegotiationError::ProtocolViolation(
                    "remote offer while a local offer is outstanding".into(),
                ));
            }
            SdpKind::Answer if !local_offer => {
                return Err(NegotiationError::ProtocolViolation(
                    "remote answer without a local offer".into(),
                ));
            }
            _ => {}
        }
        self.peer
            .set_remote_description(desc.clone())
            .await
            .map_err(|err| match err {
                EngineError::Rtc(reason) => NegotiationError::InvalidDescription(reason),
                other => NegotiationError::Engine(other),
            })?;
        self.remote = Some(desc);
        Ok(self.flush_pending().await)
    }

    pub async fn add_remote_candidate(
        &mut self,
        candidate: NetworkCandidate,
    ) -> Result<CandidateDisposition, NegotiationError> {
        self.ensure_open()?;
        if self.remote.is_none() {
            if self.pending.len() >= MAX_PENDING_CANDIDATES {
                if let Some(oldest) = self.pending.pop_front() {
                    self.discarded += 1;
                    warn!(
                        candidate = %oldest.candidate,
                        discarded = self.discarded,
                        "candidate buffer full; discarding oldest"
                    );
                }
            }
            self.pending.push_back(candidate);
            return Ok(CandidateDisposition::Buffered {
                queued: self.pending.len(),
            });
        }
        self.peer
            .add_ice_candidate(candidate)
            .await
            .map_err(|err| NegotiationError::InvalidCandidate(err.to_string()))?;
        Ok(CandidateDisposition::Applied)
    }

    async fn flush_pending(&mut self) -> FlushReport {
        let mut report = FlushReport::default();
        while let Some(candidate) = self.pending.pop_front() {
            let line = candidate.candidate.clone();
            match self.peer.add_ice_candidate(candidate).await {
                Ok(()) => report.applied += 1,
                Err(err) => {
                    // One bad candidate must not take the rest of the batch with it.
                    warn!(candidate = %line, error = %err, "buffered candidate rejected");
                    report.failed += 1;
                }
            }
        }
        if report.applied + report.failed > 0 {
            debug!(
                applied = report.applied,
                failed = report.failed,
                "flushed buffered candidates"
            );
        }
        report
    }

    pub fn attach_remote_track(&mut self, track: TrackInfo) {
        if !self.remote_tracks.contains(&track) {
            self.remote_tracks.push(track);
        }
    }

    pub fn mark_established(&mut self) {
        if !self.closed {
            self.established = true;
        }
    }

    /// Releases the engine peer. Safe to call more than once.
    pub async fn close(&mut self) -> Result<(), NegotiationError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.pending.clear();
        self.remote_tracks.clear();
        self.peer.close().await?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.closed {
            Err(NegotiationError::Engine(EngineError::Closed))
        } else {
            Ok(())
        }
    }
}
