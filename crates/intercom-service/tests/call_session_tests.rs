//! Call session integration tests.
//!
//! One `CallSession` against one `MockEndpoint`, asserting the published
//! notifications and the frames the endpoint receives.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use bytes::Bytes;
use intercom_protocol::audio::AUDIO_CHUNK_SIZE;
use intercom_protocol::{Frame, MessageType};
use intercom_service::actors::{
    CallSession, CallState, ConnectionSettings, Notification, SessionSettings,
};
use intercom_service::errors::IntercomError;
use intercom_service::notify::Notifier;
use intercom_test_utils::{AnswerMode, MockEndpoint};
use std::time::Duration;
use tokio::sync::broadcast;

fn test_settings() -> SessionSettings {
    SessionSettings {
        connection: ConnectionSettings {
            connect_timeout: Duration::from_secs(1),
            keepalive_interval: Duration::from_secs(60),
            stream_start_wait: Duration::from_millis(150),
            ..ConnectionSettings::default()
        },
        sender_poll_interval: Duration::from_millis(20),
        ..SessionSettings::default()
    }
}

fn session_for(endpoint: &MockEndpoint, notifier: &Notifier) -> CallSession {
    CallSession::new(
        "porch",
        endpoint.host(),
        endpoint.port(),
        test_settings(),
        notifier.clone(),
    )
}

/// Next session state notification, skipping audio.
async fn next_state(notifications: &mut broadcast::Receiver<Notification>) -> CallState {
    loop {
        let notification = tokio::time::timeout(Duration::from_secs(2), notifications.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("notification channel closed");
        if let Notification::SessionState { device_id, state } = notification {
            assert_eq!(device_id, "porch");
            return state;
        }
    }
}

#[tokio::test]
async fn test_call_streams_audio_and_stops() {
    let endpoint = MockEndpoint::start().await;
    let notifier = Notifier::default();
    let mut notifications = notifier.subscribe();
    let session = session_for(&endpoint, &notifier);

    assert_eq!(session.start().await.unwrap(), CallState::Streaming);
    assert_eq!(next_state(&mut notifications).await, CallState::Calling);
    assert_eq!(next_state(&mut notifications).await, CallState::Streaming);
    assert!(session.is_active());

    let start = endpoint.wait_for_frame(MessageType::Start).await;
    assert!(!start.flags.no_ring);
    assert_eq!(start.payload, Bytes::from_static(b"Intercom Hub"));

    assert!(session.queue_audio(Bytes::from_static(&[1; 512])));
    assert!(session.queue_audio(Bytes::from_static(&[2; 512])));
    endpoint.wait_for_frames(MessageType::Audio, 2).await;
    assert_eq!(
        endpoint.audio_received(),
        vec![Bytes::from_static(&[1; 512]), Bytes::from_static(&[2; 512])]
    );

    session.stop().await;
    assert_eq!(next_state(&mut notifications).await, CallState::Idle);
    assert!(session.has_ended());
    assert!(!session.queue_audio(Bytes::from_static(&[3; 512])));
    endpoint.wait_for_frame(MessageType::Stop).await;

    // Stopping again publishes nothing.
    session.stop().await;
    assert!(notifications.try_recv().is_err());
}

#[tokio::test]
async fn test_endpoint_audio_is_published() {
    let endpoint = MockEndpoint::start().await;
    let notifier = Notifier::default();
    let mut notifications = notifier.subscribe();
    let session = session_for(&endpoint, &notifier);
    session.start().await.unwrap();

    let sent = endpoint.send_silence().await;

    let audio = loop {
        let notification = tokio::time::timeout(Duration::from_secs(2), notifications.recv())
            .await
            .unwrap()
            .unwrap();
        if let Notification::AudioReceived { device_id, audio } = notification {
            assert_eq!(device_id, "porch");
            break audio;
        }
    };
    assert_eq!(audio, sent);
    assert_eq!(audio.len(), AUDIO_CHUNK_SIZE);

    session.stop().await;
}

#[tokio::test]
async fn test_ringing_call_is_answered_locally() {
    let endpoint = MockEndpoint::builder().mode(AnswerMode::Ring).start().await;
    let notifier = Notifier::default();
    let mut notifications = notifier.subscribe();
    let session = session_for(&endpoint, &notifier);

    assert_eq!(session.start().await.unwrap(), CallState::Ringing);
    assert_eq!(next_state(&mut notifications).await, CallState::Calling);
    assert_eq!(next_state(&mut notifications).await, CallState::Ringing);
    assert!(session.is_ringing());
    assert!(!session.queue_audio(Bytes::from_static(&[0; 512])));

    session.answer().await.unwrap();
    assert_eq!(next_state(&mut notifications).await, CallState::Streaming);
    assert!(session.is_active());
    assert!(!session.is_ringing());

    session.stop().await;
}

#[tokio::test]
async fn test_answer_requires_ringing() {
    let endpoint = MockEndpoint::start().await;
    let session = session_for(&endpoint, &Notifier::default());
    session.start().await.unwrap();

    assert!(matches!(
        session.answer().await,
        Err(IntercomError::NotRinging)
    ));

    session.stop().await;
}

#[tokio::test]
async fn test_answer_incoming_call() {
    let endpoint = MockEndpoint::start().await;
    let notifier = Notifier::default();
    let mut notifications = notifier.subscribe();
    let session = session_for(&endpoint, &notifier);

    assert_eq!(session.answer_incoming().await.unwrap(), CallState::Streaming);
    assert_eq!(next_state(&mut notifications).await, CallState::Streaming);
    endpoint.wait_for_frame(MessageType::Answer).await;
    assert!(endpoint.frames_of(MessageType::Start).is_empty());

    session.stop().await;
}

#[tokio::test]
async fn test_endpoint_hang_up_ends_call() {
    let endpoint = MockEndpoint::start().await;
    let notifier = Notifier::default();
    let mut notifications = notifier.subscribe();
    let session = session_for(&endpoint, &notifier);
    session.start().await.unwrap();
    assert_eq!(next_state(&mut notifications).await, CallState::Calling);
    assert_eq!(next_state(&mut notifications).await, CallState::Streaming);

    endpoint.send_frame(Frame::control(MessageType::Stop)).await;

    assert_eq!(next_state(&mut notifications).await, CallState::Idle);
    assert!(session.has_ended());
    assert!(!session.connection().is_connected());
}

#[tokio::test]
async fn test_socket_close_reports_disconnected() {
    let endpoint = MockEndpoint::start().await;
    let notifier = Notifier::default();
    let mut notifications = notifier.subscribe();
    let session = session_for(&endpoint, &notifier);
    session.start().await.unwrap();
    assert_eq!(next_state(&mut notifications).await, CallState::Calling);
    assert_eq!(next_state(&mut notifications).await, CallState::Streaming);

    endpoint.close().await;

    assert_eq!(next_state(&mut notifications).await, CallState::Disconnected);
    assert!(session.has_ended());

    // The later explicit stop is a no-op.
    session.stop().await;
    assert!(notifications.try_recv().is_err());
}

#[tokio::test]
async fn test_declined_call_fails() {
    let endpoint = MockEndpoint::builder()
        .mode(AnswerMode::Decline)
        .start()
        .await;
    let notifier = Notifier::default();
    let mut notifications = notifier.subscribe();
    let session = session_for(&endpoint, &notifier);

    assert!(session.start().await.is_err());
    assert_eq!(next_state(&mut notifications).await, CallState::Calling);
    assert_eq!(next_state(&mut notifications).await, CallState::Idle);
    assert!(session.has_ended());
    assert!(endpoint.audio_received().is_empty());
}

#[tokio::test]
async fn test_unreachable_endpoint_publishes_nothing() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let notifier = Notifier::default();
    let mut notifications = notifier.subscribe();
    let session = CallSession::new("porch", "127.0.0.1", port, test_settings(), notifier);

    assert!(matches!(
        session.start().await,
        Err(IntercomError::ConnectFailure(_))
    ));
    assert!(session.has_ended());
    assert!(notifications.try_recv().is_err());

    // An abandoned session cannot be restarted.
    assert!(matches!(
        session.start().await,
        Err(IntercomError::Cancelled)
    ));
}
