//! `BridgeSession` - two endpoints talking to each other through the hub.
//!
//! The bridge owns a source and a dest [`EndpointConnection`], one bounded
//! queue per direction and one sender task per direction. A single event
//! task consumes both connections' events, so everything the endpoints do
//! is handled in one place and in arrival order per endpoint.
//!
//! States: `idle -> calling -> connected`, or
//! `idle -> calling -> ringing -> connected` when the dest endpoint waits
//! for a local answer. `disconnected` is reachable from any active state.
//!
//! # Stop semantics
//!
//! `stop()` takes the stop lock and flips `stopped` once, so a remote hang-up
//! racing an explicit stop (or both endpoints dropping together) collapses
//! into a single teardown and a single `idle` notification.

use super::call::SessionSettings;
use super::endpoint::EndpointConnection;
use super::join_with_grace;
use super::messages::{CallState, EndpointEvent};
use super::queue::AudioQueue;
use crate::errors::IntercomError;
use crate::notify::Notifier;

use intercom_protocol::FrameFlags;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// One side of a bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
    pub device_id: String,
    pub host: String,
    pub port: u16,
    /// Display name shown on the other endpoint.
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Source,
    Dest,
}

impl Side {
    const fn as_str(self) -> &'static str {
        match self {
            Side::Source => "source",
            Side::Dest => "dest",
        }
    }
}

struct BridgeEvents {
    source: mpsc::Receiver<EndpointEvent>,
    dest: mpsc::Receiver<EndpointEvent>,
    shutdown: mpsc::Receiver<()>,
}

struct BridgeInner {
    bridge_id: String,
    source: EndpointSpec,
    dest: EndpointSpec,
    settings: SessionSettings,
    notifier: Notifier,
    source_conn: EndpointConnection,
    dest_conn: EndpointConnection,
    events: Mutex<Option<BridgeEvents>>,
    shutdown_tx: mpsc::Sender<()>,
    active: AtomicBool,
    senders_started: AtomicBool,
    stopped: AtomicBool,
    source_to_dest: AudioQueue,
    dest_to_source: AudioQueue,
    cancel: CancellationToken,
    stop_lock: Mutex<()>,
    sender_tasks: Mutex<Vec<JoinHandle<()>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a bridge. Cheap to clone.
#[derive(Clone)]
pub struct BridgeSession {
    inner: Arc<BridgeInner>,
}

impl std::fmt::Debug for BridgeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeSession")
            .field("bridge_id", &self.inner.bridge_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl BridgeSession {
    /// Bridge identifier for a source/dest pair.
    #[must_use]
    pub fn id_for(source_device_id: &str, dest_device_id: &str) -> String {
        format!("{source_device_id}_{dest_device_id}")
    }

    #[must_use]
    pub fn new(
        source: EndpointSpec,
        dest: EndpointSpec,
        settings: SessionSettings,
        notifier: Notifier,
    ) -> Self {
        let (source_conn, source_events) = EndpointConnection::new(
            source.host.clone(),
            source.port,
            settings.connection.clone(),
        );
        let (dest_conn, dest_events) =
            EndpointConnection::new(dest.host.clone(), dest.port, settings.connection.clone());
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let capacity = settings.audio_queue_capacity;

        Self {
            inner: Arc::new(BridgeInner {
                bridge_id: Self::id_for(&source.device_id, &dest.device_id),
                source,
                dest,
                settings,
                notifier,
                source_conn,
                dest_conn,
                events: Mutex::new(Some(BridgeEvents {
                    source: source_events,
                    dest: dest_events,
                    shutdown: shutdown_rx,
                })),
                shutdown_tx,
                active: AtomicBool::new(false),
                senders_started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                source_to_dest: AudioQueue::new(capacity, "source_to_dest"),
                dest_to_source: AudioQueue::new(capacity, "dest_to_source"),
                cancel: CancellationToken::new(),
                stop_lock: Mutex::new(()),
                sender_tasks: Mutex::new(Vec::new()),
                event_task: Mutex::new(None),
            }),
        }
    }

    /// Whether both handles refer to the same bridge.
    #[must_use]
    pub fn same_as(&self, other: &BridgeSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    #[must_use]
    pub fn bridge_id(&self) -> &str {
        &self.inner.bridge_id
    }

    #[must_use]
    pub fn source(&self) -> &EndpointSpec {
        &self.inner.source
    }

    #[must_use]
    pub fn dest(&self) -> &EndpointSpec {
        &self.inner.dest
    }

    /// Whether `device_id` is either side of this bridge.
    #[must_use]
    pub fn involves(&self, device_id: &str) -> bool {
        self.inner.source.device_id == device_id || self.inner.dest.device_id == device_id
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Whether audio is being relayed in both directions.
    #[must_use]
    pub fn is_relaying(&self) -> bool {
        self.inner.senders_started.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn state(&self) -> CallState {
        if self.is_stopped() {
            CallState::Idle
        } else if self.is_relaying() {
            CallState::Connected
        } else if self.is_active() || self.inner.dest_conn.is_ringing() {
            CallState::Ringing
        } else if self.inner.source_conn.is_connected() {
            CallState::Calling
        } else {
            CallState::Idle
        }
    }

    #[must_use]
    pub fn source_connection(&self) -> &EndpointConnection {
        &self.inner.source_conn
    }

    #[must_use]
    pub fn dest_connection(&self) -> &EndpointConnection {
        &self.inner.dest_conn
    }

    /// Connect both endpoints and start relaying.
    ///
    /// Returns `Connected` when both sides stream, `Ringing` when dest waits
    /// for a local answer (relaying starts once it answers).
    ///
    /// # Errors
    ///
    /// `ConnectFailure` for either side (both are left disconnected),
    /// `Cancelled` if the bridge was stopped meanwhile, or the handshake
    /// error.
    #[instrument(
        skip_all,
        name = "intercom.bridge.start",
        fields(bridge_id = %self.inner.bridge_id)
    )]
    pub async fn start(&self) -> Result<CallState, IntercomError> {
        if self.is_active() {
            return Ok(CallState::Connected);
        }
        if self.is_stopped() {
            return Err(IntercomError::Cancelled);
        }

        self.spawn_event_task().await;
        self.publish(CallState::Calling);

        match self.handshake().await {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!(
                    target: "intercom.bridge",
                    bridge_id = %self.inner.bridge_id,
                    error = %e,
                    "Bridge failed to start"
                );
                self.stop().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<CallState, IntercomError> {
        let inner = &self.inner;

        if !inner.source_conn.connect().await {
            return Err(IntercomError::ConnectFailure(inner.source_conn.endpoint()));
        }
        self.ensure_running()?;
        if !inner.dest_conn.connect().await {
            return Err(IntercomError::ConnectFailure(inner.dest_conn.endpoint()));
        }
        self.ensure_running()?;

        // The initiating side never rings.
        let source_reply = inner
            .source_conn
            .start_stream(FrameFlags::NO_RING, &inner.dest.name)
            .await;
        self.ensure_running()?;
        source_reply?;

        let dest_reply = inner
            .dest_conn
            .start_stream(FrameFlags::NONE, &inner.source.name)
            .await;
        self.ensure_running()?;
        dest_reply?;

        inner.active.store(true, Ordering::SeqCst);

        // Dest may have answered while we were still waiting on its reply.
        if inner.dest_conn.is_streaming() {
            self.begin_relay().await;
            Ok(CallState::Connected)
        } else {
            info!(
                target: "intercom.bridge",
                bridge_id = %inner.bridge_id,
                "Dest is ringing, waiting for answer"
            );
            Ok(CallState::Ringing)
        }
    }

    fn ensure_running(&self) -> Result<(), IntercomError> {
        if self.is_stopped() {
            Err(IntercomError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Answer on behalf of the ringing dest endpoint.
    ///
    /// # Errors
    ///
    /// `NotRinging` unless dest is ringing, or the send error.
    pub async fn answer_dest(&self) -> Result<(), IntercomError> {
        if !self.inner.dest_conn.is_ringing() {
            return Err(IntercomError::NotRinging);
        }
        self.inner.dest_conn.send_answer().await
    }

    /// Tear the bridge down. Concurrent and repeated calls collapse into one
    /// teardown and one `idle` notification.
    pub async fn stop(&self) {
        let _guard = self.inner.stop_lock.lock().await;
        self.teardown(true).await;
    }

    /// Stop from the event task. Gives up if another stop already owns the
    /// teardown, since that one is waiting for this task to exit.
    async fn stop_from_event_task(&self) {
        let _guard = tokio::select! {
            biased;
            () = self.inner.cancel.cancelled() => return,
            guard = self.inner.stop_lock.lock() => guard,
        };
        self.teardown(false).await;
    }

    #[instrument(
        skip_all,
        name = "intercom.bridge.stop",
        fields(bridge_id = %self.inner.bridge_id)
    )]
    async fn teardown(&self, join_event_task: bool) {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.active.store(false, Ordering::SeqCst);
        inner.cancel.cancel();

        let grace = inner.settings.connection.shutdown_grace;
        let senders: Vec<_> = inner.sender_tasks.lock().await.drain(..).collect();
        for task in senders {
            join_with_grace(task, grace, "bridge_sender").await;
        }
        if join_event_task {
            let events = inner.event_task.lock().await.take();
            if let Some(task) = events {
                join_with_grace(task, grace, "bridge_events").await;
            }
        }

        inner.source_to_dest.drain().await;
        inner.dest_to_source.drain().await;

        tokio::join!(inner.source_conn.stop_stream(), inner.dest_conn.stop_stream());
        tokio::join!(inner.source_conn.disconnect(), inner.dest_conn.disconnect());

        self.publish(CallState::Idle);
        info!(target: "intercom.bridge", bridge_id = %inner.bridge_id, "Bridge stopped");
    }

    fn publish(&self, state: CallState) {
        self.inner.notifier.bridge_state(
            &self.inner.bridge_id,
            &self.inner.source.device_id,
            &self.inner.dest.device_id,
            state,
        );
    }

    /// Start both sender tasks. Only the first caller publishes `connected`.
    async fn begin_relay(&self) {
        if self.is_stopped() || self.inner.senders_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.inner.sender_tasks.lock().await;
        tasks.push(tokio::spawn(run_sender(
            Arc::clone(&self.inner),
            Side::Source,
        )));
        tasks.push(tokio::spawn(run_sender(Arc::clone(&self.inner), Side::Dest)));
        drop(tasks);

        info!(target: "intercom.bridge", bridge_id = %self.inner.bridge_id, "Bridge connected");
        self.publish(CallState::Connected);
    }

    async fn spawn_event_task(&self) {
        let Some(events) = self.inner.events.lock().await.take() else {
            return;
        };
        let bridge = self.clone();
        let task = tokio::spawn(async move { bridge.run_events(events).await });
        *self.inner.event_task.lock().await = Some(task);
    }

    #[instrument(
        skip_all,
        name = "intercom.bridge.events",
        fields(bridge_id = %self.inner.bridge_id)
    )]
    async fn run_events(self, mut events: BridgeEvents) {
        loop {
            let (side, event) = tokio::select! {
                biased;
                () = self.inner.cancel.cancelled() => break,
                Some(()) = events.shutdown.recv() => {
                    self.end("sender failure").await;
                    break;
                }
                event = events.source.recv() => (Side::Source, event),
                event = events.dest.recv() => (Side::Dest, event),
            };
            let Some(event) = event else {
                break;
            };
            let terminal = event.is_terminal();
            self.handle_event(side, event).await;
            if terminal {
                break;
            }
        }
        debug!(target: "intercom.bridge", "Event task exiting");
    }

    async fn handle_event(&self, side: Side, event: EndpointEvent) {
        match event {
            EndpointEvent::Audio(audio) => {
                if self.is_active() {
                    let queue = match side {
                        Side::Source => &self.inner.source_to_dest,
                        Side::Dest => &self.inner.dest_to_source,
                    };
                    queue.push(audio);
                }
            }
            EndpointEvent::Connected => {}
            EndpointEvent::Ringing => {
                if side == Side::Dest {
                    self.publish(CallState::Ringing);
                } else {
                    debug!(target: "intercom.bridge", "Source rang despite NO_RING");
                }
            }
            EndpointEvent::Answered => {
                if side == Side::Dest && self.is_active() {
                    self.begin_relay().await;
                }
            }
            EndpointEvent::Disconnected => {
                self.end(disconnect_reason(side)).await;
            }
            EndpointEvent::StopReceived => {
                self.end(stop_reason(side)).await;
            }
            EndpointEvent::ErrorReceived(code) => {
                warn!(
                    target: "intercom.bridge",
                    bridge_id = %self.inner.bridge_id,
                    side = side.as_str(),
                    code = ?code,
                    "Endpoint sent ERROR"
                );
                self.end(error_reason(side)).await;
            }
        }
    }

    /// One side went away: report it, then stop the whole bridge.
    async fn end(&self, reason: &'static str) {
        if self.is_stopped() {
            return;
        }
        info!(target: "intercom.bridge", bridge_id = %self.inner.bridge_id, reason, "Bridge ending");
        self.publish(CallState::Disconnected);
        self.stop_from_event_task().await;
    }
}

const fn disconnect_reason(side: Side) -> &'static str {
    match side {
        Side::Source => "source disconnected",
        Side::Dest => "dest disconnected",
    }
}

const fn stop_reason(side: Side) -> &'static str {
    match side {
        Side::Source => "source hung up",
        Side::Dest => "dest hung up",
    }
}

const fn error_reason(side: Side) -> &'static str {
    match side {
        Side::Source => "source error",
        Side::Dest => "dest error",
    }
}

/// Forward audio captured on `from` to the opposite endpoint.
#[instrument(
    skip_all,
    name = "intercom.bridge.sender",
    fields(bridge_id = %inner.bridge_id, from = from.as_str())
)]
async fn run_sender(inner: Arc<BridgeInner>, from: Side) {
    let (queue, target) = match from {
        Side::Source => (&inner.source_to_dest, &inner.dest_conn),
        Side::Dest => (&inner.dest_to_source, &inner.source_conn),
    };
    let poll = inner.settings.sender_poll_interval;

    loop {
        let frame = tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            frame = queue.pop_timeout(poll) => frame,
        };
        if !inner.active.load(Ordering::SeqCst) {
            break;
        }
        let Some(frame) = frame else {
            continue;
        };
        match target.send_audio(frame).await {
            Ok(()) | Err(IntercomError::NotStreaming) => {}
            Err(e) => {
                warn!(target: "intercom.bridge", error = %e, "Relay send failed, stopping bridge");
                if inner.shutdown_tx.try_send(()).is_err() {
                    debug!(target: "intercom.bridge", "Shutdown already requested");
                }
                break;
            }
        }
    }
    debug!(target: "intercom.bridge", "Sender exiting");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::{ConnectionSettings, Notification};
    use bytes::Bytes;
    use intercom_protocol::{Frame, MessageType};
    use intercom_test_utils::MockEndpoint;
    use std::time::Duration;

    fn spec(device_id: &str, name: &str) -> EndpointSpec {
        EndpointSpec {
            device_id: device_id.to_string(),
            host: "127.0.0.1".to_string(),
            port: 6054,
            name: name.to_string(),
        }
    }

    #[test]
    fn test_bridge_id_is_source_then_dest() {
        assert_eq!(BridgeSession::id_for("porch", "kitchen"), "porch_kitchen");
        assert_ne!(
            BridgeSession::id_for("porch", "kitchen"),
            BridgeSession::id_for("kitchen", "porch")
        );
    }

    #[test]
    fn test_involves_either_side() {
        let bridge = BridgeSession::new(
            spec("porch", "Porch"),
            spec("kitchen", "Kitchen"),
            SessionSettings::default(),
            Notifier::default(),
        );
        assert!(bridge.involves("porch"));
        assert!(bridge.involves("kitchen"));
        assert!(!bridge.involves("garage"));
        assert_eq!(bridge.bridge_id(), "porch_kitchen");
        assert_eq!(bridge.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_concurrent_stops_publish_idle_once() {
        let notifier = Notifier::new(16);
        let mut notifications = notifier.subscribe();
        let bridge = BridgeSession::new(
            spec("porch", "Porch"),
            spec("kitchen", "Kitchen"),
            SessionSettings::default(),
            notifier,
        );

        let (a, b) = (bridge.clone(), bridge.clone());
        tokio::join!(a.stop(), b.stop());
        bridge.stop().await;

        let first = notifications.try_recv().unwrap();
        assert!(matches!(
            first,
            Notification::BridgeState {
                state: CallState::Idle,
                ..
            }
        ));
        assert!(notifications.try_recv().is_err(), "only one idle");
        assert!(matches!(bridge.start().await, Err(IntercomError::Cancelled)));
    }

    #[tokio::test]
    async fn test_answer_dest_requires_ringing() {
        let bridge = BridgeSession::new(
            spec("porch", "Porch"),
            spec("kitchen", "Kitchen"),
            SessionSettings::default(),
            Notifier::default(),
        );
        assert!(matches!(
            bridge.answer_dest().await,
            Err(IntercomError::NotRinging)
        ));
    }

    #[tokio::test]
    async fn test_relay_send_failure_stops_bridge() {
        let source = MockEndpoint::start().await;
        let dest = MockEndpoint::start().await;
        let notifier = Notifier::new(16);
        let mut notifications = notifier.subscribe();
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
        let at = |device_id: &str, name: &str, endpoint: &MockEndpoint| EndpointSpec {
            device_id: device_id.to_string(),
            host: endpoint.host(),
            port: endpoint.port(),
            name: name.to_string(),
        };
        let bridge = BridgeSession::new(
            at("porch", "Porch", &source),
            at("kitchen", "Kitchen", &dest),
            settings,
            notifier,
        );
        assert_eq!(bridge.start().await.unwrap(), CallState::Connected);

        // Too large for one frame, so the write towards dest is refused.
        let oversized = Bytes::from(vec![0; Frame::MAX_PAYLOAD_SIZE + 1]);
        assert!(bridge.inner.source_to_dest.push(oversized));

        let mut states = Vec::new();
        while states.last() != Some(&CallState::Idle) {
            let notification = tokio::time::timeout(Duration::from_secs(2), notifications.recv())
                .await
                .expect("bridge should stop")
                .unwrap();
            if let Notification::BridgeState { state, .. } = notification {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                CallState::Calling,
                CallState::Connected,
                CallState::Disconnected,
                CallState::Idle
            ]
        );

        source.wait_for_frame(MessageType::Stop).await;
        dest.wait_for_frame(MessageType::Stop).await;
        assert!(bridge.is_stopped());
        assert!(!bridge.inner.source_conn.is_connected());
        assert!(!bridge.inner.dest_conn.is_connected());

        bridge.stop().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(notifications.try_recv().is_err(), "teardown reported once");
    }
}
