//! Endpoint connection integration tests.
//!
//! Drives `EndpointConnection` against `MockEndpoint` over loopback TCP and
//! checks the frames on the wire and the event sequence.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use bytes::Bytes;
use intercom_protocol::{ErrorCode, Frame, FrameFlags, MessageType};
use intercom_service::actors::{ConnectionSettings, EndpointConnection, EndpointEvent, StreamState};
use intercom_service::errors::IntercomError;
use intercom_test_utils::{AnswerMode, MockEndpoint};
use std::time::Duration;
use tokio::sync::mpsc;

fn test_settings() -> ConnectionSettings {
    ConnectionSettings {
        connect_timeout: Duration::from_secs(1),
        // Keep keepalive PONGs out of the handshake tests.
        keepalive_interval: Duration::from_secs(60),
        stream_start_wait: Duration::from_millis(150),
        ..ConnectionSettings::default()
    }
}

fn connection_to(endpoint: &MockEndpoint) -> (EndpointConnection, mpsc::Receiver<EndpointEvent>) {
    EndpointConnection::new(endpoint.host(), endpoint.port(), test_settings())
}

async fn next_event(events: &mut mpsc::Receiver<EndpointEvent>) -> EndpointEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for endpoint event")
        .expect("event channel closed")
}

async fn next_control_event(events: &mut mpsc::Receiver<EndpointEvent>) -> EndpointEvent {
    loop {
        match next_event(events).await {
            EndpointEvent::Audio(_) => {}
            event => return event,
        }
    }
}

#[tokio::test]
async fn test_no_ring_start_is_accepted_with_pong() {
    let endpoint = MockEndpoint::start().await;
    let (connection, mut events) = connection_to(&endpoint);

    let state = connection
        .start_stream(FrameFlags::NO_RING, "Kitchen")
        .await
        .unwrap();

    assert_eq!(state, StreamState::Streaming);
    assert!(connection.is_streaming());
    assert_eq!(next_event(&mut events).await, EndpointEvent::Connected);

    let start = endpoint.wait_for_frame(MessageType::Start).await;
    assert!(start.flags.no_ring);
    assert_eq!(start.payload, Bytes::from_static(b"Kitchen"));

    connection.disconnect().await;
}

#[tokio::test]
async fn test_ringing_endpoint_streams_after_answer() {
    let endpoint = MockEndpoint::builder().mode(AnswerMode::Ring).start().await;
    let (connection, mut events) = connection_to(&endpoint);

    let state = connection
        .start_stream(FrameFlags::NONE, "Intercom Hub")
        .await
        .unwrap();
    assert_eq!(state, StreamState::Ringing);
    assert!(connection.is_ringing());
    assert_eq!(next_event(&mut events).await, EndpointEvent::Connected);
    assert_eq!(next_event(&mut events).await, EndpointEvent::Ringing);

    // Audio is refused until the endpoint confirms.
    assert!(matches!(
        connection.send_audio(Bytes::from_static(&[0; 4])).await,
        Err(IntercomError::NotStreaming)
    ));

    connection.send_answer().await.unwrap();
    assert_eq!(next_event(&mut events).await, EndpointEvent::Answered);
    assert!(connection.is_streaming());
    endpoint.wait_for_frame(MessageType::Answer).await;

    connection.disconnect().await;
}

#[tokio::test]
async fn test_silent_endpoint_falls_back_to_streaming() {
    let endpoint = MockEndpoint::builder()
        .mode(AnswerMode::Silent)
        .start()
        .await;
    let (connection, _events) = connection_to(&endpoint);

    let started = std::time::Instant::now();
    let state = connection
        .start_stream(FrameFlags::NONE, "Intercom Hub")
        .await
        .unwrap();

    assert_eq!(state, StreamState::Streaming);
    assert!(started.elapsed() >= Duration::from_millis(150));

    connection.disconnect().await;
}

#[tokio::test]
async fn test_answer_incoming_sends_answer_without_start() {
    let endpoint = MockEndpoint::start().await;
    let (connection, _events) = connection_to(&endpoint);

    let state = connection.answer_incoming().await.unwrap();

    assert_eq!(state, StreamState::Streaming);
    endpoint.wait_for_frame(MessageType::Answer).await;
    assert!(endpoint.frames_of(MessageType::Start).is_empty());

    connection.disconnect().await;
}

#[tokio::test]
async fn test_audio_flows_both_ways() {
    let endpoint = MockEndpoint::start().await;
    let (connection, mut events) = connection_to(&endpoint);
    connection
        .start_stream(FrameFlags::NONE, "Intercom Hub")
        .await
        .unwrap();

    for chunk in 0..3u8 {
        connection
            .send_audio(Bytes::from(vec![chunk; 512]))
            .await
            .unwrap();
    }
    let frames = endpoint.wait_for_frames(MessageType::Audio, 3).await;
    let firsts: Vec<u8> = frames.iter().map(|f| f.payload[0]).collect();
    assert_eq!(firsts, vec![0, 1, 2]);
    assert_eq!(connection.audio_sent(), 3);

    endpoint
        .send_frame(Frame::audio(Bytes::from_static(&[7; 512])))
        .await;
    assert_eq!(next_event(&mut events).await, EndpointEvent::Connected);
    assert_eq!(
        next_event(&mut events).await,
        EndpointEvent::Audio(Bytes::from_static(&[7; 512]))
    );
    assert_eq!(connection.audio_received(), 1);

    connection.disconnect().await;
}

#[tokio::test]
async fn test_ping_from_endpoint_is_answered() {
    let endpoint = MockEndpoint::start().await;
    let (connection, _events) = connection_to(&endpoint);
    assert!(connection.connect().await);
    endpoint.wait_for_connections(1).await;

    endpoint.send_frame(Frame::control(MessageType::Ping)).await;

    endpoint.wait_for_frame(MessageType::Pong).await;
    assert_eq!(connection.state(), StreamState::Idle);

    connection.disconnect().await;
}

#[tokio::test]
async fn test_keepalive_pings_while_idle() {
    let endpoint = MockEndpoint::builder().answer_pings(false).start().await;
    let settings = ConnectionSettings {
        keepalive_interval: Duration::from_millis(40),
        ..test_settings()
    };
    let (connection, _events) =
        EndpointConnection::new(endpoint.host(), endpoint.port(), settings);
    assert!(connection.connect().await);

    endpoint.wait_for_frames(MessageType::Ping, 2).await;

    connection.disconnect().await;
}

#[tokio::test]
async fn test_endpoint_stop_and_error_are_reported() {
    let endpoint = MockEndpoint::start().await;
    let (connection, mut events) = connection_to(&endpoint);
    connection
        .start_stream(FrameFlags::NONE, "Intercom Hub")
        .await
        .unwrap();
    assert_eq!(next_event(&mut events).await, EndpointEvent::Connected);

    endpoint.send_frame(Frame::error(ErrorCode::Busy)).await;
    assert_eq!(
        next_control_event(&mut events).await,
        EndpointEvent::ErrorReceived(ErrorCode::Busy)
    );

    endpoint.send_frame(Frame::control(MessageType::Stop)).await;
    assert_eq!(
        next_control_event(&mut events).await,
        EndpointEvent::StopReceived
    );
    assert_eq!(connection.state(), StreamState::Idle);

    connection.disconnect().await;
}

#[tokio::test]
async fn test_peer_close_reports_disconnected_once() {
    let endpoint = MockEndpoint::start().await;
    let (connection, mut events) = connection_to(&endpoint);
    connection
        .start_stream(FrameFlags::NONE, "Intercom Hub")
        .await
        .unwrap();
    assert_eq!(next_event(&mut events).await, EndpointEvent::Connected);

    endpoint.close().await;

    assert_eq!(
        next_control_event(&mut events).await,
        EndpointEvent::Disconnected
    );
    assert!(!connection.is_connected());
    assert!(matches!(
        connection.send_audio(Bytes::from_static(&[0; 4])).await,
        Err(IntercomError::NotConnected)
    ));

    // A local disconnect after the peer closed reports nothing more.
    connection.disconnect().await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_stop_stream_sends_stop_and_reconnect_works() {
    let endpoint = MockEndpoint::start().await;
    let (connection, mut events) = connection_to(&endpoint);
    connection
        .start_stream(FrameFlags::NONE, "Intercom Hub")
        .await
        .unwrap();

    connection.stop_stream().await;
    assert_eq!(connection.state(), StreamState::Idle);
    endpoint.wait_for_frame(MessageType::Stop).await;

    connection.disconnect().await;
    assert_eq!(next_event(&mut events).await, EndpointEvent::Connected);
    assert_eq!(next_event(&mut events).await, EndpointEvent::Disconnected);

    assert!(connection.connect().await);
    endpoint.wait_for_connections(2).await;
    assert_eq!(next_event(&mut events).await, EndpointEvent::Connected);

    connection.disconnect().await;
    assert_eq!(next_event(&mut events).await, EndpointEvent::Disconnected);
}

#[tokio::test]
async fn test_start_stream_against_closed_port_fails() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let (connection, mut events) = EndpointConnection::new("127.0.0.1", port, test_settings());

    assert!(matches!(
        connection.start_stream(FrameFlags::NONE, "Intercom Hub").await,
        Err(IntercomError::ConnectFailure(_))
    ));
    assert!(!connection.is_connected());
    assert!(events.try_recv().is_err());
}
