//! `EndpointConnection` - one TCP socket to one intercom endpoint.
//!
//! Each connected endpoint runs three tasks:
//! - a receive loop that decodes frames in arrival order and dispatches them
//! - a keepalive loop that sends PING while no audio is flowing
//! - a writer that exclusively owns the socket write half
//!
//! The writer is the only place bytes hit the socket, so a frame is never
//! interleaved with another or cut short by cancellation. Everything the
//! connection observes is reported as an [`EndpointEvent`] on the channel
//! returned by [`EndpointConnection::new`].
//!
//! # Lifecycle
//!
//! 1. `connect()` opens the socket and spawns the tasks
//! 2. `start_stream()` / `answer_incoming()` run the START or ANSWER handshake
//! 3. The receive loop ends on cancel, peer close, transport error or desync
//! 4. `disconnect()` cancels the tasks with a bounded grace period and
//!    `Disconnected` is emitted exactly once per connect
//!
//! `disconnect()` never waits for a connect in progress: it abandons the
//! attempt, and a socket that opens anyway is dropped before any task starts.

use super::join_with_grace;
use super::messages::{EndpointEvent, StreamState};
use crate::errors::IntercomError;
use crate::observability::metrics;

use bytes::{Bytes, BytesMut};
use intercom_protocol::{decode_header, encode_frame, CodecError, ErrorCode, Frame, FrameFlags, MessageType};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Timing and buffer sizes for one endpoint connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Bound on the TCP connect.
    pub connect_timeout: Duration,
    /// PING period while not streaming.
    pub keepalive_interval: Duration,
    /// Window for the endpoint's reply to START or ANSWER.
    pub stream_start_wait: Duration,
    /// Bound on a control frame reaching the socket.
    pub control_send_timeout: Duration,
    /// Bound on the periodic audio flush wait.
    pub audio_drain_timeout: Duration,
    /// Every this many audio frames, wait for a flush.
    pub audio_drain_interval: u64,
    /// Grace period for tasks to finish before they are aborted.
    pub shutdown_grace: Duration,
    /// Capacity of the event channel.
    pub event_buffer: usize,
    /// Capacity of the writer's outbound channel.
    pub outbound_buffer: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(5),
            stream_start_wait: Duration::from_millis(500),
            control_send_timeout: Duration::from_secs(1),
            audio_drain_timeout: Duration::from_millis(100),
            audio_drain_interval: 10,
            shutdown_grace: Duration::from_secs(1),
            event_buffer: 64,
            outbound_buffer: 32,
        }
    }
}

/// A frame queued for the writer. When `ack` is set the writer flushes
/// and reports the outcome.
struct Outbound {
    bytes: Bytes,
    ack: Option<oneshot::Sender<io::Result<()>>>,
}

/// Tasks and channels that exist only while connected.
struct Link {
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    tasks: Vec<(JoinHandle<()>, &'static str)>,
}

struct Shared {
    instance_id: u64,
    host: String,
    port: u16,
    settings: ConnectionSettings,
    connected: AtomicBool,
    state: watch::Sender<StreamState>,
    disconnect_notified: AtomicBool,
    audio_sent: AtomicU64,
    audio_received: AtomicU64,
    events: mpsc::Sender<EndpointEvent>,
    link: Mutex<Option<Link>>,
    /// Serializes connect attempts. `disconnect()` never takes it.
    connecting: Mutex<()>,
    /// Cancelled by `disconnect()` to abandon the connect in progress.
    connect_abort: Mutex<CancellationToken>,
}

/// Why the receive loop stopped.
enum LoopExit {
    Cancelled,
    PeerClosed,
    Desync(CodecError),
    Transport(io::Error),
    WriteFailed,
}

/// Handle to one endpoint connection. Cheap to clone.
#[derive(Clone)]
pub struct EndpointConnection {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for EndpointConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointConnection")
            .field("instance_id", &self.inner.instance_id)
            .field("host", &self.inner.host)
            .field("port", &self.inner.port)
            .field("connected", &self.is_connected())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl EndpointConnection {
    /// Create an unconnected handle and the receiver for its events.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        port: u16,
        settings: ConnectionSettings,
    ) -> (Self, mpsc::Receiver<EndpointEvent>) {
        let (events, receiver) = mpsc::channel(settings.event_buffer.max(1));
        let (state, _) = watch::channel(StreamState::Idle);

        let inner = Shared {
            instance_id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            host: host.into(),
            port,
            settings,
            connected: AtomicBool::new(false),
            state,
            // Nothing to report until the first successful connect.
            disconnect_notified: AtomicBool::new(true),
            audio_sent: AtomicU64::new(0),
            audio_received: AtomicU64::new(0),
            events,
            link: Mutex::new(None),
            connecting: Mutex::new(()),
            connect_abort: Mutex::new(CancellationToken::new()),
        };

        (
            Self {
                inner: Arc::new(inner),
            },
            receiver,
        )
    }

    /// Endpoint address as `host:port`, for logs.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.inner.host, self.inner.port)
    }

    #[must_use]
    pub fn instance_id(&self) -> u64 {
        self.inner.instance_id
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Current protocol state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        *self.inner.state.borrow()
    }

    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.state() == StreamState::Streaming
    }

    #[must_use]
    pub fn is_ringing(&self) -> bool {
        self.state() == StreamState::Ringing
    }

    /// Audio frames handed to the writer since creation.
    #[must_use]
    pub fn audio_sent(&self) -> u64 {
        self.inner.audio_sent.load(Ordering::Relaxed)
    }

    /// Audio frames received since creation.
    #[must_use]
    pub fn audio_received(&self) -> u64 {
        self.inner.audio_received.load(Ordering::Relaxed)
    }

    /// Open the socket and start the receive, keepalive and writer tasks.
    ///
    /// Returns `false` on timeout or refusal; never errors.
    #[instrument(
        skip_all,
        name = "intercom.endpoint.connect",
        fields(endpoint = %self.endpoint(), instance_id = self.inner.instance_id)
    )]
    pub async fn connect(&self) -> bool {
        let _connecting = self.inner.connecting.lock().await;
        if self.is_connected() {
            return true;
        }

        // A link left behind by a peer close still owns finished tasks.
        let stale = self.inner.link.lock().await.take();
        if let Some(stale) = stale {
            shutdown_link(stale, self.inner.settings.shutdown_grace).await;
        }

        let abort = self.inner.arm_connect_abort().await;
        let address = self.endpoint();
        let attempt = tokio::select! {
            () = abort.cancelled() => None,
            attempt = tokio::time::timeout(
                self.inner.settings.connect_timeout,
                TcpStream::connect(&address),
            ) => Some(attempt),
        };
        let stream = match attempt {
            Some(Ok(Ok(stream))) => stream,
            Some(Ok(Err(e))) => {
                warn!(
                    target: "intercom.endpoint",
                    endpoint = %address,
                    error = %e,
                    "Connect failed"
                );
                metrics::record_connect_failure("refused");
                return false;
            }
            Some(Err(_)) => {
                warn!(
                    target: "intercom.endpoint",
                    endpoint = %address,
                    timeout_ms = self.inner.settings.connect_timeout.as_millis(),
                    "Connect timed out"
                );
                metrics::record_connect_failure("timeout");
                return false;
            }
            None => {
                info!(target: "intercom.endpoint", endpoint = %address, "Connect abandoned by disconnect");
                return false;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(target: "intercom.endpoint", error = %e, "Failed to set TCP_NODELAY");
        }

        let mut link = self.inner.link.lock().await;
        // disconnect() cancels before it takes the link lock, so checking
        // here under the lock cannot miss one.
        if abort.is_cancelled() {
            info!(target: "intercom.endpoint", endpoint = %address, "Disconnected while connecting");
            return false;
        }

        let (read_half, write_half) = stream.into_split();
        let cancel = CancellationToken::new();
        let write_failed = CancellationToken::new();
        let (outbound, outbound_rx) = mpsc::channel(self.inner.settings.outbound_buffer.max(1));

        self.inner.state.send_replace(StreamState::Idle);
        self.inner.disconnect_notified.store(false, Ordering::SeqCst);
        self.inner.connected.store(true, Ordering::SeqCst);
        metrics::connection_opened();

        let writer = tokio::spawn(write_loop(
            self.inner.instance_id,
            BufWriter::new(write_half),
            outbound_rx,
            cancel.clone(),
            write_failed.clone(),
        ));
        let receiver = tokio::spawn(receive_loop(
            Arc::clone(&self.inner),
            BufReader::new(read_half),
            outbound.clone(),
            LinkSignals {
                cancel: cancel.clone(),
                write_failed,
            },
        ));
        let keepalive = tokio::spawn(keepalive_loop(
            self.inner.instance_id,
            self.inner.settings.keepalive_interval,
            self.inner.state.subscribe(),
            outbound.clone(),
            cancel.clone(),
        ));

        *link = Some(Link {
            outbound,
            cancel,
            tasks: vec![
                (receiver, "receive"),
                (keepalive, "keepalive"),
                (writer, "writer"),
            ],
        });
        drop(link);

        if self.inner.events.try_send(EndpointEvent::Connected).is_err() {
            debug!(target: "intercom.endpoint", "Connected event not delivered");
        }
        info!(target: "intercom.endpoint", endpoint = %address, "Connected");
        true
    }

    /// Send START and wait for the endpoint to accept or ring.
    ///
    /// Resolves to `Streaming` on PONG and `Ringing` on RING. When the
    /// endpoint stays silent for the whole reply window the call is assumed
    /// to be streaming, which keeps endpoints without the ring handshake
    /// working.
    ///
    /// # Errors
    ///
    /// Connect failure, a failed START write, or the connection closing
    /// before the endpoint replied.
    pub async fn start_stream(
        &self,
        flags: FrameFlags,
        caller_label: &str,
    ) -> Result<StreamState, IntercomError> {
        let frame = Frame::start(flags, caller_label);
        self.request_stream(frame, |state| state != StreamState::Idle)
            .await
    }

    /// Answer a call the endpoint placed: send ANSWER (no START) and wait for
    /// the PONG acknowledgement, with the same fallback as `start_stream`.
    ///
    /// # Errors
    ///
    /// Same as [`EndpointConnection::start_stream`].
    pub async fn answer_incoming(&self) -> Result<StreamState, IntercomError> {
        let frame = Frame::control(MessageType::Answer);
        self.request_stream(frame, |state| state == StreamState::Streaming)
            .await
    }

    #[instrument(
        skip_all,
        name = "intercom.endpoint.handshake",
        fields(
            endpoint = %self.endpoint(),
            instance_id = self.inner.instance_id,
            request = frame.message_type.as_str()
        )
    )]
    async fn request_stream(
        &self,
        frame: Frame,
        resolved: impl Fn(StreamState) -> bool,
    ) -> Result<StreamState, IntercomError> {
        if !self.is_connected() && !self.connect().await {
            return Err(IntercomError::ConnectFailure(self.endpoint()));
        }

        let started = Instant::now();
        let closed = self.link_token().await.ok_or(IntercomError::NotConnected)?;
        let mut state_rx = self.inner.state.subscribe();

        if let Err(e) = self.send_frame(&frame).await {
            metrics::record_stream_start("error", started.elapsed());
            return Err(e);
        }

        let wait = self.inner.settings.stream_start_wait;
        let outcome = tokio::time::timeout(wait, async {
            tokio::select! {
                () = closed.cancelled() => None,
                changed = state_rx.wait_for(|state| resolved(*state)) => changed.ok().map(|state| *state),
            }
        })
        .await;

        match outcome {
            Ok(Some(state)) => {
                let label = if state == StreamState::Ringing {
                    "ringing"
                } else {
                    "streaming"
                };
                metrics::record_stream_start(label, started.elapsed());
                debug!(target: "intercom.endpoint", state = ?state, "Endpoint replied");
                Ok(state)
            }
            Ok(None) => {
                metrics::record_stream_start("error", started.elapsed());
                Err(IntercomError::NotConnected)
            }
            Err(_) if !self.is_connected() => {
                metrics::record_stream_start("error", started.elapsed());
                Err(IntercomError::NotConnected)
            }
            Err(_) => {
                self.inner.state.send_if_modified(|state| {
                    if resolved(*state) {
                        false
                    } else {
                        *state = StreamState::Streaming;
                        true
                    }
                });
                metrics::record_stream_start("fallback", started.elapsed());
                warn!(
                    target: "intercom.endpoint",
                    wait_ms = wait.as_millis(),
                    "No reply from endpoint, assuming streaming"
                );
                Ok(self.state())
            }
        }
    }

    /// Answer locally while the endpoint is ringing. The transition to
    /// streaming happens when the endpoint confirms with ANSWER.
    ///
    /// # Errors
    ///
    /// `NotRinging` unless ringing; send errors otherwise.
    pub async fn send_answer(&self) -> Result<(), IntercomError> {
        if !self.is_connected() {
            return Err(IntercomError::NotConnected);
        }
        if !self.is_ringing() {
            warn!(
                target: "intercom.endpoint",
                instance_id = self.inner.instance_id,
                "Answer requested but endpoint is not ringing"
            );
            return Err(IntercomError::NotRinging);
        }
        self.send_control(MessageType::Answer).await
    }

    /// Queue one audio frame for the endpoint.
    ///
    /// Every `audio_drain_interval` frames this waits briefly for the writer
    /// to flush; a slow flush still counts as sent. A full writer buffer
    /// drops the frame.
    ///
    /// # Errors
    ///
    /// `NotConnected` / `NotStreaming` on wrong state, `SendFailure` when the
    /// writer is gone or the socket write failed.
    pub async fn send_audio(&self, audio: Bytes) -> Result<(), IntercomError> {
        if !self.is_connected() {
            return Err(IntercomError::NotConnected);
        }
        if !self.is_streaming() {
            return Err(IntercomError::NotStreaming);
        }

        let outbound = self.outbound().await.ok_or(IntercomError::NotConnected)?;
        let bytes = encode_frame(&Frame::audio(audio))?;

        let sequence = self.inner.audio_sent.load(Ordering::Relaxed) + 1;
        let interval = self.inner.settings.audio_drain_interval.max(1);
        let (ack, ack_rx) = if sequence % interval == 0 {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        match outbound.try_send(Outbound { bytes, ack }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::record_audio_dropped("outbound");
                return Ok(());
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(IntercomError::SendFailure("writer closed".to_string()));
            }
        }
        self.inner.audio_sent.fetch_add(1, Ordering::Relaxed);
        metrics::record_audio_sent();

        if let Some(ack_rx) = ack_rx {
            match tokio::time::timeout(self.inner.settings.audio_drain_timeout, ack_rx).await {
                Ok(Ok(Err(e))) => return Err(IntercomError::SendFailure(e.to_string())),
                Ok(Err(_)) => return Err(IntercomError::SendFailure("writer closed".to_string())),
                Ok(Ok(Ok(()))) | Err(_) => {}
            }
        }
        Ok(())
    }

    /// Send a payload-less control frame and wait for it to be flushed.
    ///
    /// # Errors
    ///
    /// `NotConnected`, `SendFailure`, or `Timeout` after
    /// `control_send_timeout`.
    pub async fn send_control(&self, message_type: MessageType) -> Result<(), IntercomError> {
        self.send_frame(&Frame::control(message_type)).await
    }

    async fn send_frame(&self, frame: &Frame) -> Result<(), IntercomError> {
        let outbound = self.outbound().await.ok_or(IntercomError::NotConnected)?;
        let bytes = encode_frame(frame)?;
        let (ack, ack_rx) = oneshot::channel();

        let sent = tokio::time::timeout(self.inner.settings.control_send_timeout, async {
            outbound
                .send(Outbound {
                    bytes,
                    ack: Some(ack),
                })
                .await
                .map_err(|_| IntercomError::SendFailure("writer closed".to_string()))?;
            match ack_rx.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(IntercomError::SendFailure(e.to_string())),
                Err(_) => Err(IntercomError::SendFailure("writer closed".to_string())),
            }
        })
        .await;

        sent.unwrap_or_else(|_| {
            Err(IntercomError::Timeout(format!(
                "{} send",
                frame.message_type.as_str()
            )))
        })
    }

    /// Stop accepting audio immediately, then tell the endpoint with a
    /// best-effort STOP.
    pub async fn stop_stream(&self) {
        self.inner.state.send_replace(StreamState::Idle);
        if !self.is_connected() {
            return;
        }
        if let Err(e) = self.send_control(MessageType::Stop).await {
            warn!(
                target: "intercom.endpoint",
                instance_id = self.inner.instance_id,
                error = %e,
                "Failed to send STOP"
            );
        }
    }

    /// Tear the connection down. Safe to call any number of times.
    pub async fn disconnect(&self) {
        self.inner.abort_connect().await;
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.state.send_replace(StreamState::Idle);

        let link = self.inner.link.lock().await.take();
        if let Some(link) = link {
            shutdown_link(link, self.inner.settings.shutdown_grace).await;
        }

        if self.inner.mark_disconnected()
            && self.inner.events.try_send(EndpointEvent::Disconnected).is_err()
        {
            debug!(
                target: "intercom.endpoint",
                instance_id = self.inner.instance_id,
                "Disconnected event not delivered"
            );
        }
    }

    async fn outbound(&self) -> Option<mpsc::Sender<Outbound>> {
        self.inner
            .link
            .lock()
            .await
            .as_ref()
            .map(|link| link.outbound.clone())
    }

    async fn link_token(&self) -> Option<CancellationToken> {
        self.inner
            .link
            .lock()
            .await
            .as_ref()
            .map(|link| link.cancel.clone())
    }
}

impl Shared {
    /// Fresh abort token for the connect about to start.
    async fn arm_connect_abort(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.connect_abort.lock().await = token.clone();
        token
    }

    async fn abort_connect(&self) {
        self.connect_abort.lock().await.cancel();
    }

    /// Flip to disconnected. Returns `true` only for the first call per
    /// connect, which is the one that must report it.
    fn mark_disconnected(&self) -> bool {
        self.connected.store(false, Ordering::SeqCst);
        self.state.send_replace(StreamState::Idle);
        if self.disconnect_notified.swap(true, Ordering::SeqCst) {
            return false;
        }
        metrics::connection_closed();
        true
    }

    /// Deliver a control event unless the connection is being torn down.
    async fn emit(&self, event: EndpointEvent, cancel: &CancellationToken) {
        tokio::select! {
            () = cancel.cancelled() => {}
            sent = self.events.send(event) => {
                if sent.is_err() {
                    debug!(target: "intercom.endpoint", instance_id = self.instance_id, "No event listener");
                }
            }
        }
    }

    async fn dispatch(
        &self,
        frame: Frame,
        outbound: &mpsc::Sender<Outbound>,
        cancel: &CancellationToken,
    ) {
        match frame.message_type {
            MessageType::Audio => {
                self.audio_received.fetch_add(1, Ordering::Relaxed);
                metrics::record_audio_received();
                if self.events.try_send(EndpointEvent::Audio(frame.payload)).is_err() {
                    metrics::record_audio_dropped("inbound");
                }
            }
            MessageType::Pong => {
                // PONG after START is the accept signal; otherwise it answers a PING.
                let accepted = self.state.send_if_modified(|state| {
                    if *state == StreamState::Idle {
                        *state = StreamState::Streaming;
                        true
                    } else {
                        false
                    }
                });
                debug!(target: "intercom.endpoint", instance_id = self.instance_id, accepted, "PONG");
            }
            MessageType::Ring => {
                debug!(target: "intercom.endpoint", instance_id = self.instance_id, "RING");
                self.state.send_replace(StreamState::Ringing);
                self.emit(EndpointEvent::Ringing, cancel).await;
            }
            MessageType::Answer => {
                debug!(target: "intercom.endpoint", instance_id = self.instance_id, "ANSWER");
                self.state.send_replace(StreamState::Streaming);
                self.emit(EndpointEvent::Answered, cancel).await;
            }
            MessageType::Stop => {
                debug!(target: "intercom.endpoint", instance_id = self.instance_id, "STOP from endpoint");
                self.state.send_replace(StreamState::Idle);
                self.emit(EndpointEvent::StopReceived, cancel).await;
            }
            MessageType::Ping => {
                let reply = Frame::control(MessageType::Pong);
                match encode_frame(&reply) {
                    Ok(bytes) => {
                        if outbound.try_send(Outbound { bytes, ack: None }).is_err() {
                            debug!(target: "intercom.endpoint", instance_id = self.instance_id, "PONG not queued");
                        }
                    }
                    Err(e) => warn!(target: "intercom.endpoint", error = %e, "Failed to encode PONG"),
                }
            }
            MessageType::Error => {
                let code = ErrorCode::from_payload(&frame.payload);
                warn!(
                    target: "intercom.endpoint",
                    instance_id = self.instance_id,
                    code = ?code,
                    "ERROR from endpoint"
                );
                self.emit(EndpointEvent::ErrorReceived(code), cancel).await;
            }
            MessageType::Start => {
                debug!(
                    target: "intercom.endpoint",
                    instance_id = self.instance_id,
                    "Ignoring START from endpoint"
                );
            }
        }
    }
}

/// Cancel a link's tasks and wait for each.
async fn shutdown_link(link: Link, grace: Duration) {
    link.cancel.cancel();
    drop(link.outbound);
    for (task, name) in link.tasks {
        join_with_grace(task, grace, name).await;
    }
}

/// Tokens the receive loop watches besides the socket.
struct LinkSignals {
    /// Teardown requested by `disconnect()` or by the receive loop itself.
    cancel: CancellationToken,
    /// The writer hit an I/O error and exited.
    write_failed: CancellationToken,
}

async fn read_exact_or_cancel(
    reader: &mut BufReader<OwnedReadHalf>,
    buf: &mut [u8],
    signals: &LinkSignals,
) -> Result<(), LoopExit> {
    tokio::select! {
        () = signals.cancel.cancelled() => Err(LoopExit::Cancelled),
        () = signals.write_failed.cancelled() => Err(LoopExit::WriteFailed),
        read = reader.read_exact(buf) => match read {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(LoopExit::PeerClosed),
            Err(e) => Err(LoopExit::Transport(e)),
        },
    }
}

async fn read_frames(
    shared: &Shared,
    reader: &mut BufReader<OwnedReadHalf>,
    outbound: &mpsc::Sender<Outbound>,
    signals: &LinkSignals,
) -> LoopExit {
    let mut header = [0u8; Frame::HEADER_SIZE];
    loop {
        if let Err(exit) = read_exact_or_cancel(reader, &mut header, signals).await {
            return exit;
        }

        let (frame_header, skip) = match decode_header(&mut header.as_slice()) {
            Ok(frame_header) => (Some(frame_header), 0),
            Err(CodecError::UnknownMessageType { code, length }) => {
                debug!(
                    target: "intercom.endpoint",
                    instance_id = shared.instance_id,
                    code,
                    length,
                    "Skipping unknown message type"
                );
                (None, length)
            }
            Err(e) => return LoopExit::Desync(e),
        };

        let length = frame_header.map_or(skip, |h| h.length);
        let mut payload = BytesMut::zeroed(length);
        if length > 0 {
            if let Err(exit) = read_exact_or_cancel(reader, &mut payload, signals).await {
                return exit;
            }
        }

        if let Some(frame_header) = frame_header {
            let frame = Frame {
                message_type: frame_header.message_type,
                flags: frame_header.flags,
                payload: payload.freeze(),
            };
            shared.dispatch(frame, outbound, &signals.cancel).await;
        }
    }
}

#[instrument(
    skip_all,
    name = "intercom.endpoint.receive",
    fields(instance_id = shared.instance_id)
)]
async fn receive_loop(
    shared: Arc<Shared>,
    mut reader: BufReader<OwnedReadHalf>,
    outbound: mpsc::Sender<Outbound>,
    signals: LinkSignals,
) {
    let exit = read_frames(&shared, &mut reader, &outbound, &signals).await;

    match &exit {
        LoopExit::Cancelled => {
            debug!(target: "intercom.endpoint", "Receive loop cancelled");
            return;
        }
        LoopExit::PeerClosed => {
            info!(target: "intercom.endpoint", "Endpoint closed the connection");
        }
        LoopExit::Desync(e) => {
            metrics::record_protocol_desync();
            warn!(target: "intercom.endpoint", error = %e, "Protocol desync, closing connection");
        }
        LoopExit::Transport(e) => {
            warn!(target: "intercom.endpoint", error = %e, "Receive failed, closing connection");
        }
        LoopExit::WriteFailed => {
            warn!(target: "intercom.endpoint", "Write failed, closing connection");
        }
    }

    // Stops the keepalive loop and the writer (which shuts the socket down).
    signals.cancel.cancel();
    if shared.mark_disconnected() {
        let grace = shared.settings.shutdown_grace;
        if shared
            .events
            .send_timeout(EndpointEvent::Disconnected, grace)
            .await
            .is_err()
        {
            debug!(target: "intercom.endpoint", "Disconnected event not delivered");
        }
    }
}

#[instrument(skip_all, name = "intercom.endpoint.keepalive", fields(instance_id = instance_id))]
async fn keepalive_loop(
    instance_id: u64,
    period: Duration,
    state: watch::Receiver<StreamState>,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                // Audio is proof of life; PING would only disturb its cadence.
                if *state.borrow() == StreamState::Streaming {
                    continue;
                }
                let Ok(bytes) = encode_frame(&Frame::control(MessageType::Ping)) else {
                    continue;
                };
                if outbound.send(Outbound { bytes, ack: None }).await.is_err() {
                    break;
                }
                debug!(target: "intercom.endpoint", instance_id, "PING");
            }
        }
    }
}

#[instrument(skip_all, name = "intercom.endpoint.writer", fields(instance_id = instance_id))]
async fn write_loop(
    instance_id: u64,
    mut writer: BufWriter<OwnedWriteHalf>,
    mut outbound: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
    write_failed: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            next = outbound.recv() => next,
        };
        let Some(Outbound { bytes, ack }) = next else {
            break;
        };

        let mut result = writer.write_all(&bytes).await;
        if result.is_ok() && (ack.is_some() || outbound.is_empty()) {
            result = writer.flush().await;
        }

        match result {
            Ok(()) => {
                if let Some(ack) = ack {
                    let _ = ack.send(Ok(()));
                }
            }
            Err(e) => {
                warn!(target: "intercom.endpoint", instance_id, error = %e, "Write failed");
                if let Some(ack) = ack {
                    let _ = ack.send(Err(e));
                }
                // The receive loop reports the disconnect.
                write_failed.cancel();
                break;
            }
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!(target: "intercom.endpoint", instance_id, error = %e, "Socket shutdown failed");
    }
}
