//! Message types for communication between connections, sessions and the
//! notification sink.
//!
//! An endpoint connection reports everything it observes as a typed
//! [`EndpointEvent`] on a single channel. Sessions consume that stream and
//! publish [`Notification`]s for whatever sits outside the core.

use bytes::Bytes;
use intercom_protocol::ErrorCode;
use serde::{Serialize, Serializer};

/// Events emitted by an endpoint connection, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    /// Socket connected and loops started.
    Connected,
    /// Audio payload received.
    Audio(Bytes),
    /// Endpoint is ringing (auto-answer off).
    Ringing,
    /// Endpoint answered; streaming has begun.
    Answered,
    /// Endpoint sent STOP (hang-up on the endpoint side).
    StopReceived,
    /// Endpoint sent ERROR (decline, busy, ...).
    ErrorReceived(ErrorCode),
    /// Connection is gone. Emitted at most once per connect.
    Disconnected,
}

impl EndpointEvent {
    /// Whether this event ends any call the connection is part of.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EndpointEvent::Disconnected
                | EndpointEvent::StopReceived
                | EndpointEvent::ErrorReceived(_)
        )
    }
}

/// Per-connection protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    /// Connected (or not), no call in progress.
    #[default]
    Idle,
    /// START sent, endpoint replied RING.
    Ringing,
    /// Audio may flow.
    Streaming,
}

/// Externally visible state of a call session or bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    /// Nothing in progress.
    Idle,
    /// Connecting and waiting for the endpoint's reply.
    Calling,
    /// Waiting for a local answer on the endpoint.
    Ringing,
    /// Call session audio is flowing.
    Streaming,
    /// Bridge audio is flowing in both directions.
    Connected,
    /// The endpoint went away.
    Disconnected,
}

impl CallState {
    /// Lowercase name, as used on the wire to external callers.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Calling => "calling",
            CallState::Ringing => "ringing",
            CallState::Streaming => "streaming",
            CallState::Connected => "connected",
            CallState::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State-change and audio notifications published to the outside world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// Call session state changed.
    SessionState {
        device_id: String,
        state: CallState,
    },
    /// Bridge state changed.
    BridgeState {
        bridge_id: String,
        source_device_id: String,
        dest_device_id: String,
        state: CallState,
    },
    /// Audio received from an endpoint in a call session.
    AudioReceived {
        device_id: String,
        #[serde(serialize_with = "serialize_base64")]
        audio: Bytes,
    },
}

fn serialize_base64<S: Serializer>(audio: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    use base64::Engine;
    serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(audio))
}

impl Notification {
    /// SSE event name for this notification.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Notification::SessionState { .. } => "intercom_state",
            Notification::BridgeState { .. } => "intercom_bridge_state",
            Notification::AudioReceived { .. } => "intercom_audio",
        }
    }
}
