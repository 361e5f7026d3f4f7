use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use super::{
    ConnectivityState, EngineError, EngineEvent, EngineEvents, LocalMedia, RtcEngine, RtcPeer,
    TrackInfo, TrackKind,
};
use crate::protocol::{NetworkCandidate, SdpKind, SessionDescription};

/// Which local tracks to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

pub struct WebRtcEngine {
    api: API,
    rtc_config: RTCConfiguration,
    constraints: MediaConstraints,
}

impl WebRtcEngine {
    pub fn new(
        ice_servers: Vec<RTCIceServer>,
        constraints: MediaConstraints,
    ) -> Result<Self, EngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(rtc_err)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(rtc_err)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            rtc_config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
            constraints,
        })
    }
}

/// Outgoing tracks. The capture pipeline writes samples into these.
pub struct WebRtcMedia {
    audio: Option<Arc<TrackLocalStaticSample>>,
    video: Option<Arc<TrackLocalStaticSample>>,
}

impl WebRtcMedia {
    pub fn audio_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.audio.clone()
    }

    pub fn video_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.video.clone()
    }

    fn local_tracks(&self) -> impl Iterator<Item = &Arc<TrackLocalStaticSample>> {
        self.audio.iter().chain(self.video.iter())
    }
}

impl LocalMedia for WebRtcMedia {
    fn tracks(&self) -> Vec<TrackInfo> {
        let audio = self
            .audio
            .iter()
            .map(|t| TrackInfo::new(TrackKind::Audio, t.id()));
        let video = self
            .video
            .iter()
            .map(|t| TrackInfo::new(TrackKind::Video, t.id()));
        audio.chain(video).collect()
    }

    fn stop(&mut self) {
        self.audio = None;
        self.video = None;
    }
}

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl RtcEngine for WebRtcEngine {
    type Media = WebRtcMedia;
    type Peer = WebRtcPeer;

    async fn acquire_media(&self) -> Result<WebRtcMedia, EngineError> {
        let MediaConstraints { audio, video } = self.constraints;
        if !audio && !video {
            return Err(EngineError::Media(
                "neither audio nor video requested".into(),
            ));
        }
        let stream_id = format!("parley-{}", Uuid::new_v4());
        let track = |mime: &str, id: &str| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime.to_owned(),
                    ..Default::default()
                },
                id.to_owned(),
                stream_id.clone(),
            ))
        };
        Ok(WebRtcMedia {
            audio: audio.then(|| track(MIME_TYPE_OPUS, "audio")),
            video: video.then(|| track(MIME_TYPE_VP8, "video")),
        })
    }

    async fn create_peer(
        &self,
        media: &WebRtcMedia,
        events: EngineEvents,
    ) -> Result<WebRtcPeer, EngineError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_config.clone())
                .await
                .map_err(rtc_err)?,
        );

        for track in media.local_tracks() {
            pc.add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(rtc_err)?;
        }

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("local candidate gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        tx.send(EngineEvent::LocalCandidate(init.into()));
                    }
                    Err(err) => warn!(error = %err, "could not serialize local candidate"),
                }
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            trace!(?state, "peer connection state");
            if let Some(state) = connectivity(state) {
                tx.send(EngineEvent::Connectivity(state));
            }
            Box::pin(async {})
        }));

        let tx = events;
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                _ => TrackKind::Video,
            };
            tx.send(EngineEvent::RemoteTrack(TrackInfo::new(kind, track.id())));
            Box::pin(async {})
        }));

        Ok(WebRtcPeer { pc })
    }
}

#[async_trait]
impl RtcPeer for WebRtcPeer {
    async fn create_offer(&mut self) -> Result<SessionDescription, EngineError> {
        let offer = self.pc.create_offer(None).await.map_err(rtc_err)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, EngineError> {
        let answer = self.pc.create_answer(None).await.map_err(rtc_err)?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<(), EngineError> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(rtc_err)
    }

    async fn set_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), EngineError> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(rtc_err)
    }

    async fn add_ice_candidate(&mut self, candidate: NetworkCandidate) -> Result<(), EngineError> {
        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(rtc_err)
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        self.pc.close().await.map_err(rtc_err)
    }
}

fn rtc_err(err: webrtc::Error) -> EngineError {
    EngineError::Rtc(err.to_string())
}

fn connectivity(state: RTCPeerConnectionState) -> Option<ConnectivityState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectivityState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectivityState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectivityState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectivityState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectivityState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectivityState::Closed),
        _ => None,
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(rtc_err)
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, EngineError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(EngineError::Rtc(format!(
            "unsupported description type {other}"
        ))),
    }
}

impl From<RTCIceCandidateInit> for NetworkCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_m_line_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<NetworkCandidate> for RTCIceCandidateInit {
    fn from(candidate: NetworkCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment,
        }
    }
}
