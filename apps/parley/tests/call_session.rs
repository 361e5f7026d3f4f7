use std::time::Duration;

use parley_core::engine::mock::MockEngine;
use parley_core::engine::{ConnectivityState, EngineEvent, TrackInfo, TrackKind};
use parley_core::protocol::SignalMessage;
use parley_core::session::NO_REMOTE_STREAM;
use parley_core::signaling::{ChannelEvent, ChannelLink, LoopbackEnd};
use parley_core::{
    CallCommand, CallSession, CallStatus, NegotiationError, NegotiatorState, Role, SessionConfig,
    SessionHandle,
};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

async fn wait_until(
    status: &mut watch::Receiver<CallStatus>,
    what: &str,
    predicate: impl FnMut(&CallStatus) -> bool,
) -> CallStatus {
    match timeout(Duration::from_secs(5), status.wait_for(predicate)).await {
        Ok(Ok(current)) => current.clone(),
        Ok(Err(_)) => panic!("session went away while waiting for {what}"),
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

/// Two-party stand-in for the relay: each side's frames go to the other.
/// Returns injectors for relay-originated events.
fn bridge(
    a: LoopbackEnd,
    b: LoopbackEnd,
) -> (
    mpsc::UnboundedSender<ChannelEvent>,
    mpsc::UnboundedSender<ChannelEvent>,
) {
    let LoopbackEnd {
        sent: mut a_sent,
        events: a_in,
    } = a;
    let LoopbackEnd {
        sent: mut b_sent,
        events: b_in,
    } = b;
    a_in.send(ChannelEvent::Connected).unwrap();
    b_in.send(ChannelEvent::Connected).unwrap();

    let (a_inject, b_inject) = (a_in.clone(), b_in.clone());
    tokio::spawn(async move {
        while let Some(frame) = a_sent.recv().await {
            if b_in.send(ChannelEvent::Frame(frame)).is_err() {
                break;
            }
        }
    });
    tokio::spawn(async move {
        while let Some(frame) = b_sent.recv().await {
            if a_in.send(ChannelEvent::Frame(frame)).is_err() {
                break;
            }
        }
    });
    (a_inject, b_inject)
}

fn session(engine: &MockEngine, config: SessionConfig) -> (CallSession<MockEngine>, SessionHandle, LoopbackEnd) {
    let (link, end) = ChannelLink::in_memory();
    let (session, handle) = CallSession::new(engine.clone(), link, config);
    (session, handle, end)
}

fn ready(s: &CallStatus) -> bool {
    s.state == NegotiatorState::Ready && s.channel_connected
}

#[test_timeout::tokio_timeout_test]
async fn two_endpoints_call_hang_up_and_rearm() {
    let engine_a = MockEngine::new("a");
    let engine_b = MockEngine::new("b");
    let (session_a, mut a, end_a) = session(&engine_a, SessionConfig::default());
    let (session_b, mut b, end_b) = session(&engine_b, SessionConfig::default());
    let (_inject_a, inject_b) = bridge(end_a, end_b);
    let task_a = tokio::spawn(session_a.run());
    let task_b = tokio::spawn(session_b.run());

    let status = wait_until(&mut a.status, "a ready", ready).await;
    assert_eq!(status.remote_surface(), NO_REMOTE_STREAM);
    assert_eq!(status.toggle_label(), "Start Call");
    wait_until(&mut b.status, "b ready", ready).await;

    a.commands.send(CallCommand::Toggle).unwrap();
    wait_until(&mut b.status, "b answered", |s| {
        s.state == NegotiatorState::AnswerExchanged
    })
    .await;
    wait_until(&mut a.status, "a got answer", |s| {
        s.state == NegotiatorState::AnswerExchanged
    })
    .await;

    engine_a.emit(EngineEvent::Connectivity(ConnectivityState::Connected));
    engine_b.emit(EngineEvent::Connectivity(ConnectivityState::Connected));
    engine_b.emit(EngineEvent::RemoteTrack(TrackInfo::new(TrackKind::Video, "a-video")));

    let status = wait_until(&mut b.status, "b established with media", |s| {
        s.state == NegotiatorState::Established && !s.remote_tracks.is_empty()
    })
    .await;
    assert_eq!(status.role, Some(Role::Callee));
    assert_eq!(status.remote_surface(), "video:a-video");
    assert_eq!(status.toggle_label(), "End Call");
    let status = wait_until(&mut a.status, "a established", |s| {
        s.state == NegotiatorState::Established
    })
    .await;
    assert_eq!(status.role, Some(Role::Caller));

    // A hangs up and is immediately ready for another call.
    a.commands.send(CallCommand::Toggle).unwrap();
    let status = wait_until(&mut a.status, "a re-armed", |s| {
        s.state == NegotiatorState::Ready && s.role.is_none()
    })
    .await;
    assert_eq!(status.remote_surface(), NO_REMOTE_STREAM);
    assert_eq!(engine_a.peers_created(), 2);
    assert_eq!(engine_a.media_stopped(), 1);

    // The relay tells B its peer is gone.
    inject_b
        .send(ChannelEvent::Frame(SignalMessage::PeerLeft.into_frame()))
        .unwrap();
    wait_until(&mut b.status, "b re-armed", |s| {
        s.state == NegotiatorState::Ready && s.remote_tracks.is_empty()
    })
    .await;
    assert_eq!(engine_b.peers_created(), 2);

    a.commands.send(CallCommand::Shutdown).unwrap();
    b.commands.send(CallCommand::Shutdown).unwrap();
    task_a.await.unwrap().unwrap();
    task_b.await.unwrap().unwrap();
    assert_eq!(engine_a.peers_closed(), 2);
}

#[test_timeout::tokio_timeout_test]
async fn stalled_negotiation_times_out_and_rearms() {
    let engine = MockEngine::new("lonely");
    let config = SessionConfig {
        negotiation_timeout: Some(Duration::from_millis(50)),
    };
    let (session, mut handle, end) = session(&engine, config);
    end.events.send(ChannelEvent::Connected).unwrap();
    let task = tokio::spawn(session.run());

    wait_until(&mut handle.status, "ready", ready).await;
    handle.commands.send(CallCommand::StartCall).unwrap();
    wait_until(&mut handle.status, "offer sent", |s| {
        s.state == NegotiatorState::OfferSent
    })
    .await;
    wait_until(&mut handle.status, "timeout re-arm", |s| {
        s.state == NegotiatorState::Ready && s.role.is_none()
    })
    .await;
    assert_eq!(engine.peers_created(), 2);

    drop(handle.commands);
    task.await.unwrap().unwrap();
    drop(end);
}

#[test_timeout::tokio_timeout_test]
async fn media_failure_ends_the_session() {
    let engine = MockEngine::failing_media("no-camera");
    let (session, handle, _end) = session(&engine, SessionConfig::default());

    let err = session.run().await.unwrap_err();
    assert!(matches!(err, NegotiationError::MediaUnavailable(_)));
    let status = handle.status.borrow().clone();
    assert_eq!(status.state, NegotiatorState::Idle);
    assert!(status.last_error.unwrap().contains("camera permission denied"));
}

#[test_timeout::tokio_timeout_test]
async fn bad_frames_are_reported_not_fatal() {
    let engine = MockEngine::new("b");
    let (session, mut handle, end) = session(&engine, SessionConfig::default());
    end.events.send(ChannelEvent::Connected).unwrap();
    let task = tokio::spawn(session.run());
    wait_until(&mut handle.status, "ready", ready).await;

    let stray_answer = parley_core::protocol::RelayFrame {
        event: parley_core::protocol::EventKind::Answer,
        data: serde_json::json!({"type": "answer", "sdp": "v=0"}),
    };
    end.events.send(ChannelEvent::Frame(stray_answer)).unwrap();
    let status = wait_until(&mut handle.status, "error surfaced", |s| s.last_error.is_some()).await;
    assert_eq!(status.state, NegotiatorState::Ready);
    assert!(status.last_error.unwrap().starts_with("protocol violation"));

    end.events
        .send(ChannelEvent::Disconnected("relay restarted".into()))
        .unwrap();
    wait_until(&mut handle.status, "channel down", |s| !s.channel_connected).await;

    handle.commands.send(CallCommand::Shutdown).unwrap();
    task.await.unwrap().unwrap();
}
