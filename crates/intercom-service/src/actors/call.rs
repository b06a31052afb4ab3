//! `CallSession` - one endpoint in a call with the hub.
//!
//! The session owns one [`EndpointConnection`], a bounded outbound audio
//! queue and two tasks:
//! - an event task consuming the connection's events
//! - a sender task draining the queue into the connection (only while
//!   streaming)
//!
//! States: `idle -> calling -> {streaming | ringing} -> streaming -> idle`,
//! with `disconnected` reachable from any non-idle state. A session is
//! single-use: once it has ended it stays idle and a new session is created
//! for the next call.

use super::endpoint::{ConnectionSettings, EndpointConnection};
use super::join_with_grace;
use super::messages::{CallState, EndpointEvent, StreamState};
use super::queue::AudioQueue;
use crate::errors::IntercomError;
use crate::notify::Notifier;

use bytes::Bytes;
use intercom_protocol::{FrameFlags, DEFAULT_PORT};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Settings shared by call sessions and bridges.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Per-connection timing.
    pub connection: ConnectionSettings,
    /// Capacity of each outbound audio queue.
    pub audio_queue_capacity: usize,
    /// Display name sent in START by call sessions.
    pub caller_name: String,
    /// Port used when a request does not name one.
    pub default_port: u16,
    /// How often an idle sender task rechecks its session.
    pub sender_poll_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default(),
            audio_queue_capacity: 8,
            caller_name: "Intercom Hub".to_string(),
            default_port: DEFAULT_PORT,
            sender_poll_interval: Duration::from_secs(1),
        }
    }
}

struct CallInner {
    device_id: String,
    host: String,
    port: u16,
    settings: SessionSettings,
    notifier: Notifier,
    connection: EndpointConnection,
    events: Mutex<Option<mpsc::Receiver<EndpointEvent>>>,
    active: AtomicBool,
    ringing: AtomicBool,
    ended: AtomicBool,
    queue: AudioQueue,
    cancel: CancellationToken,
    sender_task: Mutex<Option<JoinHandle<()>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a call session. Cheap to clone.
#[derive(Clone)]
pub struct CallSession {
    inner: Arc<CallInner>,
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("device_id", &self.inner.device_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CallSession {
    /// Create a session for `device_id` at `host:port`. Nothing is
    /// connected until [`CallSession::start`] or
    /// [`CallSession::answer_incoming`].
    #[must_use]
    pub fn new(
        device_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        settings: SessionSettings,
        notifier: Notifier,
    ) -> Self {
        let host = host.into();
        let (connection, events) =
            EndpointConnection::new(host.clone(), port, settings.connection.clone());
        let queue = AudioQueue::new(settings.audio_queue_capacity, "session");

        Self {
            inner: Arc::new(CallInner {
                device_id: device_id.into(),
                host,
                port,
                settings,
                notifier,
                connection,
                events: Mutex::new(Some(events)),
                active: AtomicBool::new(false),
                ringing: AtomicBool::new(false),
                ended: AtomicBool::new(false),
                queue,
                cancel: CancellationToken::new(),
                sender_task: Mutex::new(None),
                event_task: Mutex::new(None),
            }),
        }
    }

    /// Whether both handles refer to the same session.
    #[must_use]
    pub fn same_as(&self, other: &CallSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ringing(&self) -> bool {
        self.inner.ringing.load(Ordering::SeqCst)
    }

    /// Whether the session has stopped or its endpoint went away.
    #[must_use]
    pub fn has_ended(&self) -> bool {
        self.inner.ended.load(Ordering::SeqCst)
    }

    /// Externally visible state.
    #[must_use]
    pub fn state(&self) -> CallState {
        if self.has_ended() {
            CallState::Idle
        } else if self.is_active() {
            CallState::Streaming
        } else if self.is_ringing() {
            CallState::Ringing
        } else if self.inner.connection.is_connected() {
            CallState::Calling
        } else {
            CallState::Idle
        }
    }

    /// The underlying connection.
    #[must_use]
    pub fn connection(&self) -> &EndpointConnection {
        &self.inner.connection
    }

    /// Call the endpoint.
    ///
    /// Returns `Streaming` if the endpoint accepted (or is already active)
    /// and `Ringing` if it is waiting for a local answer.
    ///
    /// # Errors
    ///
    /// `ConnectFailure` if the endpoint is unreachable, `Cancelled` if the
    /// session was stopped meanwhile, or the handshake error.
    #[instrument(
        skip_all,
        name = "intercom.call.start",
        fields(device_id = %self.inner.device_id)
    )]
    pub async fn start(&self) -> Result<CallState, IntercomError> {
        if self.is_active() {
            return Ok(CallState::Streaming);
        }
        if self.has_ended() {
            return Err(IntercomError::Cancelled);
        }

        self.spawn_event_task().await;

        if !self.inner.connection.connect().await {
            self.abandon().await;
            return Err(IntercomError::ConnectFailure(self.inner.connection.endpoint()));
        }
        self.inner
            .notifier
            .session_state(&self.inner.device_id, CallState::Calling);

        let outcome = self
            .inner
            .connection
            .start_stream(FrameFlags::NONE, &self.inner.settings.caller_name)
            .await;
        self.resolve_handshake(outcome).await
    }

    /// Accept a call the endpoint placed itself: connect and send ANSWER
    /// without START.
    ///
    /// # Errors
    ///
    /// Same as [`CallSession::start`].
    #[instrument(
        skip_all,
        name = "intercom.call.answer_incoming",
        fields(device_id = %self.inner.device_id)
    )]
    pub async fn answer_incoming(&self) -> Result<CallState, IntercomError> {
        if self.is_active() {
            return Ok(CallState::Streaming);
        }
        if self.has_ended() {
            return Err(IntercomError::Cancelled);
        }

        self.spawn_event_task().await;

        if !self.inner.connection.connect().await {
            self.abandon().await;
            return Err(IntercomError::ConnectFailure(self.inner.connection.endpoint()));
        }

        let outcome = self.inner.connection.answer_incoming().await;
        self.resolve_handshake(outcome).await
    }

    async fn resolve_handshake(
        &self,
        outcome: Result<StreamState, IntercomError>,
    ) -> Result<CallState, IntercomError> {
        if self.has_ended() {
            return Err(IntercomError::Cancelled);
        }

        match outcome {
            Ok(StreamState::Streaming) => {
                self.go_active().await;
                info!(target: "intercom.call", device_id = %self.inner.device_id, "Streaming");
                Ok(CallState::Streaming)
            }
            Ok(StreamState::Ringing) => {
                self.inner.ringing.store(true, Ordering::SeqCst);
                info!(target: "intercom.call", device_id = %self.inner.device_id, "Ringing");
                Ok(CallState::Ringing)
            }
            Ok(StreamState::Idle) => {
                self.stop().await;
                Err(IntercomError::Internal("handshake resolved to idle".to_string()))
            }
            Err(e) => {
                warn!(
                    target: "intercom.call",
                    device_id = %self.inner.device_id,
                    error = %e,
                    "Call failed"
                );
                self.stop().await;
                Err(e)
            }
        }
    }

    /// Answer locally while the endpoint is ringing.
    ///
    /// # Errors
    ///
    /// `NotRinging` unless ringing, or the send error.
    pub async fn answer(&self) -> Result<(), IntercomError> {
        if !self.is_ringing() {
            return Err(IntercomError::NotRinging);
        }
        self.inner.connection.send_answer().await
    }

    /// Queue audio for the endpoint. Never waits; returns `false` when the
    /// session is not streaming or the frame was dropped.
    pub fn queue_audio(&self, audio: Bytes) -> bool {
        if !self.is_active() {
            return false;
        }
        self.inner.queue.push(audio)
    }

    /// End the call. Idempotent: only the first call (or the first remote
    /// hang-up) publishes the terminal notification.
    #[instrument(
        skip_all,
        name = "intercom.call.stop",
        fields(device_id = %self.inner.device_id)
    )]
    pub async fn stop(&self) {
        if self.inner.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.active.store(false, Ordering::SeqCst);
        self.inner.ringing.store(false, Ordering::SeqCst);
        self.inner
            .notifier
            .session_state(&self.inner.device_id, CallState::Idle);

        self.inner.cancel.cancel();
        let grace = self.inner.settings.connection.shutdown_grace;
        let sender = self.inner.sender_task.lock().await.take();
        if let Some(task) = sender {
            join_with_grace(task, grace, "call_sender").await;
        }
        let events = self.inner.event_task.lock().await.take();
        if let Some(task) = events {
            join_with_grace(task, grace, "call_events").await;
        }

        self.inner.connection.stop_stream().await;
        self.inner.connection.disconnect().await;
        self.inner.queue.drain().await;

        info!(target: "intercom.call", device_id = %self.inner.device_id, "Call stopped");
    }

    /// Release resources after a failed connect, before anything was
    /// published.
    async fn abandon(&self) {
        self.inner.ended.store(true, Ordering::SeqCst);
        self.inner.cancel.cancel();
        let events = self.inner.event_task.lock().await.take();
        if let Some(task) = events {
            join_with_grace(task, self.inner.settings.connection.shutdown_grace, "call_events")
                .await;
        }
    }

    /// Mark the session streaming. Only the first caller starts the sender
    /// and publishes `streaming`.
    async fn go_active(&self) {
        self.inner.ringing.store(false, Ordering::SeqCst);
        if self.inner.active.swap(true, Ordering::SeqCst) {
            return;
        }
        self.spawn_sender().await;
        self.inner
            .notifier
            .session_state(&self.inner.device_id, CallState::Streaming);
    }

    async fn spawn_event_task(&self) {
        let Some(events) = self.inner.events.lock().await.take() else {
            return;
        };
        let session = self.clone();
        let task = tokio::spawn(async move { session.run_events(events).await });
        *self.inner.event_task.lock().await = Some(task);
    }

    async fn spawn_sender(&self) {
        let mut slot = self.inner.sender_task.lock().await;
        if slot.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *slot = Some(tokio::spawn(run_sender(inner)));
    }

    #[instrument(
        skip_all,
        name = "intercom.call.events",
        fields(device_id = %self.inner.device_id)
    )]
    async fn run_events(self, mut events: mpsc::Receiver<EndpointEvent>) {
        loop {
            let event = tokio::select! {
                biased;
                () = self.inner.cancel.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                break;
            };
            let terminal = event.is_terminal();
            self.handle_event(event).await;
            if terminal {
                break;
            }
        }
        debug!(target: "intercom.call", "Event task exiting");
    }

    async fn handle_event(&self, event: EndpointEvent) {
        match event {
            EndpointEvent::Audio(audio) => {
                if self.is_active() {
                    self.inner
                        .notifier
                        .audio_received(&self.inner.device_id, audio);
                }
            }
            EndpointEvent::Connected => {}
            EndpointEvent::Ringing => {
                self.inner.ringing.store(true, Ordering::SeqCst);
                self.inner
                    .notifier
                    .session_state(&self.inner.device_id, CallState::Ringing);
            }
            EndpointEvent::Answered => {
                info!(target: "intercom.call", device_id = %self.inner.device_id, "Answered on endpoint");
                self.go_active().await;
            }
            EndpointEvent::Disconnected => {
                self.end(CallState::Disconnected, "endpoint disconnected").await;
            }
            EndpointEvent::StopReceived => {
                self.end(CallState::Idle, "endpoint hung up").await;
            }
            EndpointEvent::ErrorReceived(code) => {
                warn!(
                    target: "intercom.call",
                    device_id = %self.inner.device_id,
                    code = ?code,
                    "Endpoint rejected the call"
                );
                self.end(CallState::Idle, "endpoint error").await;
            }
        }
    }

    /// Tear down in response to the endpoint. Runs on the event task, so it
    /// cancels the sender without joining itself.
    async fn end(&self, state: CallState, reason: &'static str) {
        if self.inner.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: "intercom.call", device_id = %self.inner.device_id, reason, "Call ended");
        self.inner.active.store(false, Ordering::SeqCst);
        self.inner.ringing.store(false, Ordering::SeqCst);
        self.inner
            .notifier
            .session_state(&self.inner.device_id, state);

        self.inner.cancel.cancel();
        let sender = self.inner.sender_task.lock().await.take();
        if let Some(task) = sender {
            join_with_grace(task, self.inner.settings.connection.shutdown_grace, "call_sender")
                .await;
        }
        self.inner.connection.disconnect().await;
        self.inner.queue.drain().await;
    }
}

#[instrument(
    skip_all,
    name = "intercom.call.sender",
    fields(device_id = %inner.device_id)
)]
async fn run_sender(inner: Arc<CallInner>) {
    let poll = inner.settings.sender_poll_interval;
    loop {
        let frame = tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            frame = inner.queue.pop_timeout(poll) => frame,
        };
        let Some(frame) = frame else {
            continue;
        };
        match inner.connection.send_audio(frame).await {
            Ok(()) | Err(IntercomError::NotStreaming) => {}
            Err(e) => {
                warn!(target: "intercom.call", error = %e, "Audio send failed, sender exiting");
                break;
            }
        }
    }
    debug!(target: "intercom.call", "Sender exiting");
}
