//! Integration tests for session negotiation against the reference server

use nvc_core::NvcError;
use nvc_signaling::{
    retry_with_backoff, DataChannelState, PeerSession, PeerTransport, ProcessFramesPayload,
    RelayPeerTransport, RetryPolicy, ServerSettings, SessionConfig, SessionEvent,
    SignalingMessage, SignalingServer, CLOSE_GOING_AWAY, CLOSE_NORMAL,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn test_addr() -> SocketAddr {
    SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)
}

fn quick_config() -> SessionConfig {
    SessionConfig {
        connect_timeout: Duration::from_secs(2),
        ..SessionConfig::default()
    }
}

async fn start_test_server(settings: ServerSettings) -> (SignalingServer, String) {
    let server = SignalingServer::with_settings(test_addr(), settings);
    let addr = server.start_background().await.unwrap();
    (server, format!("ws://{}", addr))
}

async fn next_event(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<SessionEvent>,
) -> SessionEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("session event channel closed")
}

#[tokio::test]
async fn test_handshake_completes() {
    let (server, url) = start_test_server(ServerSettings::default()).await;
    let peer = Arc::new(RelayPeerTransport::new());

    let (session, _events) = PeerSession::establish(&url, quick_config(), peer.clone())
        .await
        .unwrap();

    assert!(session.is_connected());
    assert_eq!(session.data_channel_state(), DataChannelState::Open);
    assert_eq!(
        session.server_config().and_then(|c| c.buffer_size),
        Some(60)
    );
    assert!(session.server_session_id().is_some());
    assert_eq!(server.offers_answered(), 1);

    // The local host candidate is trickled after the offer
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.candidates_received(), 1);

    session.close(CLOSE_NORMAL, "Cleanup").await;
    assert!(!session.is_connected());
}

#[tokio::test]
async fn test_candidates_before_answer_are_applied_after_it() {
    let settings = ServerSettings {
        candidate_before_answer: true,
        ..ServerSettings::default()
    };
    let (_server, url) = start_test_server(settings).await;
    let peer = Arc::new(RelayPeerTransport::new());

    let (_session, _events) = PeerSession::establish(&url, quick_config(), peer.clone())
        .await
        .unwrap();

    // Adding the candidate before the answer would have been rejected
    assert!(peer.has_remote_description());
    assert_eq!(peer.remote_candidates().len(), 1);
}

#[tokio::test]
async fn test_frame_tokens_are_streamed() {
    let settings = ServerSettings {
        frame_interval: Duration::from_millis(1),
        ..ServerSettings::default()
    };
    let (server, url) = start_test_server(settings).await;
    server.add_video(3, (0..5).map(|i| vec![i as f32; 32]).collect());

    let (session, mut events) =
        PeerSession::establish(&url, quick_config(), Arc::new(RelayPeerTransport::new()))
            .await
            .unwrap();

    session
        .send(&SignalingMessage::ProcessFrames(ProcessFramesPayload {
            video_id: 3,
            current_frame: 2,
            reference_frame: 0,
        }))
        .unwrap();

    let mut indices = Vec::new();
    while indices.len() < 3 {
        if let SessionEvent::FrameToken(token) = next_event(&mut events).await {
            indices.push(token.frame_index);
        }
    }
    assert_eq!(indices, vec![2, 3, 4]);
}

#[tokio::test]
async fn test_unknown_video_reports_error() {
    let (_server, url) = start_test_server(ServerSettings::default()).await;
    let (session, mut events) =
        PeerSession::establish(&url, quick_config(), Arc::new(RelayPeerTransport::new()))
            .await
            .unwrap();

    session
        .send(&SignalingMessage::ProcessFrames(ProcessFramesPayload {
            video_id: 99,
            current_frame: 0,
            reference_frame: 0,
        }))
        .unwrap();

    match next_event(&mut events).await {
        SessionEvent::ServerError(payload) => assert!(payload.message.contains("99")),
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_restart_renegotiates() {
    let (server, url) = start_test_server(ServerSettings::default()).await;
    let (session, mut events) =
        PeerSession::establish(&url, quick_config(), Arc::new(RelayPeerTransport::new()))
            .await
            .unwrap();

    server.restart_all();

    assert_eq!(next_event(&mut events).await, SessionEvent::Restarting);
    assert_eq!(next_event(&mut events).await, SessionEvent::Renegotiated);
    assert_eq!(server.offers_answered(), 2);
    assert!(session.is_connected());
}

#[tokio::test]
async fn test_server_disconnect_closes_session() {
    let (server, url) = start_test_server(ServerSettings::default()).await;
    let (session, mut events) =
        PeerSession::establish(&url, quick_config(), Arc::new(RelayPeerTransport::new()))
            .await
            .unwrap();

    server.disconnect_all(CLOSE_GOING_AWAY, "maintenance");

    match next_event(&mut events).await {
        SessionEvent::Closed(close) => {
            assert_eq!(close.code, CLOSE_GOING_AWAY);
            assert!(close.should_reconnect());
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(!session.is_connected());
}

#[tokio::test]
async fn test_handshake_timeout() {
    // Accepts TCP connections but never answers the WebSocket upgrade
    let listener = tokio::net::TcpListener::bind(test_addr()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let config = SessionConfig {
        connect_timeout: Duration::from_millis(200),
        ..SessionConfig::default()
    };
    let result = PeerSession::establish(
        &format!("ws://{}", addr),
        config,
        Arc::new(RelayPeerTransport::new()),
    )
    .await;

    match result {
        Err(e @ NvcError::Timeout { .. }) => assert!(e.is_recoverable()),
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_reconnect_attempts_are_bounded() {
    // Reserve a port, then free it so connections are refused
    let listener = tokio::net::TcpListener::bind(test_addr()).await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let policy = RetryPolicy {
        max_attempts: 4,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        ..RetryPolicy::default()
    };
    let mut attempts_seen = 0;
    let mut retries = 0;

    let result = retry_with_backoff(
        "connect",
        &policy,
        |attempt| {
            attempts_seen = attempt;
            let url = url.clone();
            async move {
                PeerSession::establish(&url, quick_config(), Arc::new(RelayPeerTransport::new()))
                    .await
            }
        },
        |_, _| retries += 1,
    )
    .await;

    assert_eq!(attempts_seen, 4);
    assert_eq!(retries, 3);
    match result {
        Err(NvcError::MaxRetriesExceeded { attempts, .. }) => assert_eq!(attempts, 4),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("connection to a closed port succeeded"),
    }
}
