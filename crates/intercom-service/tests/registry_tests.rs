//! Session registry integration tests.
//!
//! Replacement and eviction rules across call sessions and bridges, using
//! `MockEndpoint`s as the devices.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use bytes::Bytes;
use intercom_protocol::MessageType;
use intercom_service::actors::{
    BridgeRequest, CallState, ConnectionSettings, Notification, SessionRegistry, SessionSettings,
};
use intercom_service::errors::IntercomError;
use intercom_service::notify::Notifier;
use intercom_test_utils::{AnswerMode, MockEndpoint};
use std::time::Duration;
use tokio::sync::broadcast;

fn test_registry() -> SessionRegistry {
    let settings = SessionSettings {
        connection: ConnectionSettings {
            connect_timeout: Duration::from_secs(1),
            keepalive_interval: Duration::from_secs(60),
            stream_start_wait: Duration::from_millis(150),
            shutdown_grace: Duration::from_millis(500),
            ..ConnectionSettings::default()
        },
        sender_poll_interval: Duration::from_millis(20),
        ..SessionSettings::default()
    };
    SessionRegistry::new(settings, Notifier::default())
}

fn bridge_request(source: &MockEndpoint, dest: &MockEndpoint) -> BridgeRequest {
    BridgeRequest {
        source_device_id: "porch".to_string(),
        source_host: source.host(),
        source_port: Some(source.port()),
        source_name: Some("Porch".to_string()),
        dest_device_id: "kitchen".to_string(),
        dest_host: dest.host(),
        dest_port: Some(dest.port()),
        dest_name: None,
    }
}

async fn wait_for_session_state(
    notifications: &mut broadcast::Receiver<Notification>,
    device: &str,
    wanted: CallState,
) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Notification::SessionState { device_id, state } =
                notifications.recv().await.unwrap()
            {
                if device_id == device && state == wanted {
                    return;
                }
            }
        }
    })
    .await
    .expect("expected session state notification");
}

#[tokio::test]
async fn test_start_snapshot_and_stop() {
    let endpoint = MockEndpoint::start().await;
    let registry = test_registry();

    let state = registry
        .start("porch", &endpoint.host(), Some(endpoint.port()))
        .await
        .unwrap();
    assert_eq!(state, CallState::Streaming);

    let snapshot = registry.snapshot().await;
    assert_eq!(snapshot.sessions.len(), 1);
    assert_eq!(snapshot.sessions[0].device_id, "porch");
    assert_eq!(snapshot.sessions[0].port, endpoint.port());
    assert_eq!(snapshot.sessions[0].state, CallState::Streaming);

    assert!(registry
        .queue_audio("porch", Bytes::from_static(&[5; 512]))
        .await
        .unwrap());
    endpoint.wait_for_frame(MessageType::Audio).await;

    assert!(registry.stop("porch").await);
    assert!(!registry.stop("porch").await);
    assert!(registry.snapshot().await.sessions.is_empty());
}

#[tokio::test]
async fn test_second_start_replaces_first_session() {
    let endpoint = MockEndpoint::start().await;
    let registry = test_registry();
    let mut notifications = registry.notifier().subscribe();

    registry
        .start("porch", &endpoint.host(), Some(endpoint.port()))
        .await
        .unwrap();
    registry
        .start("porch", &endpoint.host(), Some(endpoint.port()))
        .await
        .unwrap();

    endpoint.wait_for_connections(2).await;
    endpoint.wait_for_frame(MessageType::Stop).await;
    wait_for_session_state(&mut notifications, "porch", CallState::Idle).await;
    assert_eq!(registry.snapshot().await.sessions.len(), 1);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_failed_start_is_not_registered() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let registry = test_registry();

    assert!(matches!(
        registry.start("porch", "127.0.0.1", Some(port)).await,
        Err(IntercomError::ConnectFailure(_))
    ));
    assert!(registry.snapshot().await.sessions.is_empty());
}

#[tokio::test]
async fn test_abandoned_start_still_completes() {
    let endpoint = MockEndpoint::builder().mode(AnswerMode::Silent).start().await;
    let registry = test_registry();

    // The caller gives up while the endpoint is still deciding.
    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        registry.start("porch", &endpoint.host(), Some(endpoint.port())),
    )
    .await;
    assert!(abandoned.is_err());

    // The handshake runs to its fallback instead of hanging in `calling`.
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let snapshot = registry.snapshot().await;
            if snapshot.sessions.first().map(|s| s.state) == Some(CallState::Streaming) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("abandoned start should finish");

    assert!(registry.stop("porch").await);
    endpoint.wait_for_frame(MessageType::Stop).await;
    assert!(registry.snapshot().await.sessions.is_empty());
    assert_eq!(endpoint.connection_count(), 1);
}

#[tokio::test]
async fn test_queue_audio_before_answer_is_rejected() {
    let endpoint = MockEndpoint::builder().mode(AnswerMode::Ring).start().await;
    let registry = test_registry();

    let state = registry
        .start("porch", &endpoint.host(), Some(endpoint.port()))
        .await
        .unwrap();
    assert_eq!(state, CallState::Ringing);

    assert!(matches!(
        registry
            .queue_audio("porch", Bytes::from_static(&[0; 512]))
            .await,
        Err(IntercomError::NotStreaming)
    ));

    registry.answer("porch").await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while registry.snapshot().await.sessions[0].state != CallState::Streaming {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session should stream after answer");

    registry.shutdown().await;
}

#[tokio::test]
async fn test_bridge_evicts_device_sessions() {
    let source = MockEndpoint::start().await;
    let dest = MockEndpoint::start().await;
    let registry = test_registry();
    let mut notifications = registry.notifier().subscribe();

    registry
        .start("porch", &source.host(), Some(source.port()))
        .await
        .unwrap();

    let request = bridge_request(&source, &dest);
    assert_eq!(registry.bridge(&request).await.unwrap(), CallState::Connected);

    wait_for_session_state(&mut notifications, "porch", CallState::Idle).await;
    let snapshot = registry.snapshot().await;
    assert!(snapshot.sessions.is_empty());
    assert_eq!(snapshot.bridges.len(), 1);
    assert_eq!(snapshot.bridges[0].bridge_id, "porch_kitchen");
    assert_eq!(snapshot.bridges[0].state, CallState::Connected);

    // Blank dest name falls back to the default display name.
    let dest_start = dest.wait_for_frame(MessageType::Start).await;
    assert_eq!(dest_start.payload, Bytes::from_static(b"Porch"));
    let source_starts = source.wait_for_frames(MessageType::Start, 2).await;
    assert_eq!(source_starts[1].payload, Bytes::from_static(b"Intercom"));

    assert!(registry.bridge_stop("porch_kitchen").await);
    assert!(!registry.bridge_stop("porch_kitchen").await);
}

#[tokio::test]
async fn test_auto_bridge_rejects_duplicate_and_answer_reaches_dest() {
    let source = MockEndpoint::start().await;
    let dest = MockEndpoint::builder().mode(AnswerMode::Ring).start().await;
    let registry = test_registry();
    let request = bridge_request(&source, &dest);

    assert_eq!(
        registry.auto_bridge(&request).await.unwrap(),
        CallState::Ringing
    );
    assert!(matches!(
        registry.auto_bridge(&request).await,
        Err(IntercomError::AlreadyBridging(_))
    ));
    // Only the first bridge ever connected.
    assert_eq!(source.connection_count(), 1);

    // "kitchen" has no call session; the answer goes to the bridge.
    registry.answer("kitchen").await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while registry.snapshot().await.bridges[0].state != CallState::Connected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("bridge should connect after answer");

    // Stopping either device ends the bridge.
    assert!(registry.stop("kitchen").await);
    assert!(registry.snapshot().await.bridges.is_empty());
}

#[tokio::test]
async fn test_concurrent_auto_bridges_admit_one() {
    let source = MockEndpoint::start().await;
    let dest = MockEndpoint::builder().mode(AnswerMode::Silent).start().await;
    let registry = test_registry();
    let request = bridge_request(&source, &dest);

    let (first, second) = tokio::join!(
        registry.auto_bridge(&request),
        registry.auto_bridge(&request)
    );
    let (won, lost) = if first.is_ok() {
        (first, second)
    } else {
        (second, first)
    };
    assert_eq!(won.unwrap(), CallState::Connected);
    assert!(matches!(
        lost,
        Err(IntercomError::AlreadyBridging(id)) if id == "porch_kitchen"
    ));
    assert_eq!(source.connection_count(), 1);
    assert_eq!(dest.connection_count(), 1);
    assert_eq!(registry.snapshot().await.bridges.len(), 1);

    assert!(registry.bridge_stop("porch_kitchen").await);
}

#[tokio::test]
async fn test_abandoned_bridge_start_still_connects() {
    let source = MockEndpoint::start().await;
    let dest = MockEndpoint::builder().mode(AnswerMode::Silent).start().await;
    let registry = test_registry();
    let request = bridge_request(&source, &dest);

    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), registry.auto_bridge(&request)).await;
    assert!(abandoned.is_err());

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let snapshot = registry.snapshot().await;
            if snapshot.bridges.first().map(|b| b.state) == Some(CallState::Connected) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("abandoned bridge start should finish");

    assert!(registry.bridge_stop("porch_kitchen").await);
    source.wait_for_frame(MessageType::Stop).await;
    dest.wait_for_frame(MessageType::Stop).await;
}

#[tokio::test]
async fn test_manual_bridge_replaces_existing() {
    let source = MockEndpoint::start().await;
    let dest = MockEndpoint::start().await;
    let registry = test_registry();
    let request = bridge_request(&source, &dest);

    registry.bridge(&request).await.unwrap();
    registry.bridge(&request).await.unwrap();

    source.wait_for_connections(2).await;
    dest.wait_for_connections(2).await;
    let snapshot = registry.snapshot().await;
    assert_eq!(snapshot.bridges.len(), 1);
    assert_eq!(snapshot.bridges[0].state, CallState::Connected);

    registry.shutdown().await;
    assert_eq!(registry.snapshot().await, Default::default());
}

#[tokio::test]
async fn test_ended_sessions_are_pruned() {
    let endpoint = MockEndpoint::start().await;
    let registry = test_registry();
    let mut notifications = registry.notifier().subscribe();

    registry
        .start("porch", &endpoint.host(), Some(endpoint.port()))
        .await
        .unwrap();
    endpoint.close().await;
    wait_for_session_state(&mut notifications, "porch", CallState::Disconnected).await;

    assert!(registry.snapshot().await.sessions.is_empty());
}
