//! Mock intercom endpoint for service testing.
//!
//! Listens on `127.0.0.1` with an ephemeral port and speaks the endpoint side
//! of the wire protocol. It can be configured to:
//! - Answer START immediately, ring first, stay silent or decline
//! - Answer or ignore keepalive PINGs
//!
//! Every frame it receives is recorded for later assertions, and tests can
//! push arbitrary frames or raw bytes back to the service.
//!
//! # Example
//!
//! ```rust,ignore
//! use intercom_test_utils::{AnswerMode, MockEndpoint};
//!
//! let endpoint = MockEndpoint::builder()
//!     .mode(AnswerMode::AutoAnswer)
//!     .start()
//!     .await;
//!
//! // connect the service to endpoint.port() ...
//! endpoint.send_silence().await;
//! ```

use bytes::Bytes;
use intercom_protocol::audio::silence_chunk;
use intercom_protocol::{decode_header, encode_frame, ErrorCode, Frame, MessageType};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long the `wait_for_*` helpers wait before failing the test.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// How the mock replies to a START without the no-ring flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnswerMode {
    /// Reply PONG: streaming starts immediately.
    #[default]
    AutoAnswer,
    /// Reply RING; confirm with ANSWER once the service sends ANSWER.
    Ring,
    /// Never reply to START or ANSWER.
    Silent,
    /// Reply ERROR with status `Busy`.
    Decline,
}

/// Builder for [`MockEndpoint`] configuration.
#[derive(Debug, Clone)]
pub struct MockEndpointBuilder {
    mode: AnswerMode,
    answer_pings: bool,
}

impl Default for MockEndpointBuilder {
    fn default() -> Self {
        Self {
            mode: AnswerMode::AutoAnswer,
            answer_pings: true,
        }
    }
}

impl MockEndpointBuilder {
    /// Set the reply to START.
    #[must_use]
    pub fn mode(mut self, mode: AnswerMode) -> Self {
        self.mode = mode;
        self
    }

    /// Whether PING is answered with PONG (default: true).
    #[must_use]
    pub fn answer_pings(mut self, answer: bool) -> Self {
        self.answer_pings = answer;
        self
    }

    /// Bind the listener and start accepting connections.
    ///
    /// # Panics
    ///
    /// Panics if the loopback listener cannot be bound.
    pub async fn start(self) -> MockEndpoint {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("mock endpoint should bind a loopback port");
        let addr = listener
            .local_addr()
            .expect("bound listener should have an address");

        let shared = Arc::new(Shared {
            mode: self.mode,
            answer_pings: self.answer_pings,
            received: StdMutex::new(Vec::new()),
            writer: Mutex::new(None),
            connections: AtomicUsize::new(0),
            rang: AtomicBool::new(false),
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, Arc::clone(&shared), cancel.clone()));

        MockEndpoint {
            addr,
            shared,
            cancel,
            task,
        }
    }
}

struct Shared {
    mode: AnswerMode,
    answer_pings: bool,
    received: StdMutex<Vec<Frame>>,
    /// Write half of the most recent connection.
    writer: Mutex<Option<OwnedWriteHalf>>,
    connections: AtomicUsize,
    /// Set once RING was sent; the next ANSWER is confirmed with ANSWER.
    rang: AtomicBool,
}

impl Shared {
    async fn reply(&self, frame: Frame) {
        let bytes = encode_frame(&frame).expect("reply frame should encode");
        let mut writer = self.writer.lock().await;
        if let Some(writer) = writer.as_mut() {
            // The service may already be gone; a failed reply is not an error.
            let _ = writer.write_all(&bytes).await;
        }
    }

    async fn react(&self, frame: &Frame) {
        match frame.message_type {
            MessageType::Start if frame.flags.no_ring => {
                self.reply(Frame::control(MessageType::Pong)).await;
            }
            MessageType::Start => match self.mode {
                AnswerMode::AutoAnswer => self.reply(Frame::control(MessageType::Pong)).await,
                AnswerMode::Ring => {
                    self.rang.store(true, Ordering::SeqCst);
                    self.reply(Frame::control(MessageType::Ring)).await;
                }
                AnswerMode::Silent => {}
                AnswerMode::Decline => self.reply(Frame::error(ErrorCode::Busy)).await,
            },
            // ANSWER to our RING confirms with ANSWER; ANSWER to a call we
            // placed ourselves is acknowledged with PONG.
            MessageType::Answer if self.rang.swap(false, Ordering::SeqCst) => {
                self.reply(Frame::control(MessageType::Answer)).await;
            }
            MessageType::Answer if self.mode != AnswerMode::Silent => {
                self.reply(Frame::control(MessageType::Pong)).await;
            }
            MessageType::Ping if self.answer_pings => {
                self.reply(Frame::control(MessageType::Pong)).await;
            }
            _ => {}
        }
    }
}

/// Scripted intercom endpoint.
///
/// Dropping the mock stops accepting connections and closes open ones.
pub struct MockEndpoint {
    addr: SocketAddr,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MockEndpoint {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> MockEndpointBuilder {
        MockEndpointBuilder::default()
    }

    /// Start a mock with default settings ([`AnswerMode::AutoAnswer`]).
    pub async fn start() -> Self {
        Self::builder().start().await
    }

    #[must_use]
    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Number of connections accepted so far.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Every frame received so far, in arrival order.
    #[must_use]
    pub fn received(&self) -> Vec<Frame> {
        self.shared
            .received
            .lock()
            .expect("received frames lock poisoned")
            .clone()
    }

    /// Received frames of one type, in arrival order.
    #[must_use]
    pub fn frames_of(&self, message_type: MessageType) -> Vec<Frame> {
        self.received()
            .into_iter()
            .filter(|frame| frame.message_type == message_type)
            .collect()
    }

    /// Payloads of all received AUDIO frames.
    #[must_use]
    pub fn audio_received(&self) -> Vec<Bytes> {
        self.frames_of(MessageType::Audio)
            .into_iter()
            .map(|frame| frame.payload)
            .collect()
    }

    /// Wait for the first frame of `message_type`.
    ///
    /// # Panics
    ///
    /// Panics if none arrives within [`DEFAULT_WAIT`].
    pub async fn wait_for_frame(&self, message_type: MessageType) -> Frame {
        self.wait_for_frames(message_type, 1)
            .await
            .into_iter()
            .next()
            .expect("at least one frame")
    }

    /// Wait until at least `count` frames of `message_type` have arrived and
    /// return all of them.
    ///
    /// # Panics
    ///
    /// Panics if they do not arrive within [`DEFAULT_WAIT`].
    pub async fn wait_for_frames(&self, message_type: MessageType, count: usize) -> Vec<Frame> {
        let result = tokio::time::timeout(DEFAULT_WAIT, async {
            loop {
                let frames = self.frames_of(message_type);
                if frames.len() >= count {
                    return frames;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        })
        .await;
        match result {
            Ok(frames) => frames,
            Err(_) => panic!(
                "expected {count} {} frame(s), received {:?}",
                message_type.as_str(),
                self.received()
            ),
        }
    }

    /// Wait until `count` connections have been accepted.
    ///
    /// # Panics
    ///
    /// Panics if they are not within [`DEFAULT_WAIT`].
    pub async fn wait_for_connections(&self, count: usize) {
        let result = tokio::time::timeout(DEFAULT_WAIT, async {
            while self.connection_count() < count {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        })
        .await;
        assert!(
            result.is_ok(),
            "expected {count} connection(s), accepted {}",
            self.connection_count()
        );
    }

    /// Send a frame to the service on the most recent connection.
    ///
    /// # Panics
    ///
    /// Panics if no connection is open or the write fails.
    pub async fn send_frame(&self, frame: Frame) {
        let bytes = encode_frame(&frame).expect("frame should encode");
        self.send_raw(&bytes).await;
    }

    /// Send one chunk of silence, as a microphone in a quiet room would.
    /// Returns the payload sent.
    pub async fn send_silence(&self) -> Bytes {
        let chunk = silence_chunk();
        self.send_frame(Frame::audio(chunk.clone())).await;
        chunk
    }

    /// Send raw bytes to the service, bypassing the encoder.
    ///
    /// # Panics
    ///
    /// Panics if no connection is open or the write fails.
    pub async fn send_raw(&self, bytes: &[u8]) {
        let mut writer = self.shared.writer.lock().await;
        let writer = writer.as_mut().expect("no open connection to write to");
        writer
            .write_all(bytes)
            .await
            .expect("write to service should succeed");
    }

    /// Close the most recent connection, as an endpoint that hangs up its
    /// socket would.
    pub async fn close(&self) {
        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

impl Drop for MockEndpoint {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        let stream = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(_) => break,
            },
        };
        let _ = stream.set_nodelay(true);
        shared.connections.fetch_add(1, Ordering::SeqCst);

        let (reader, writer) = stream.into_split();
        *shared.writer.lock().await = Some(writer);
        tokio::spawn(read_loop(reader, Arc::clone(&shared), cancel.child_token()));
    }
}

async fn read_loop(mut reader: OwnedReadHalf, shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = read_frame(&mut reader) => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        shared
            .received
            .lock()
            .expect("received frames lock poisoned")
            .push(frame.clone());
        shared.react(&frame).await;
    }
}

/// Read one frame. `None` on EOF, read error or an undecodable header.
async fn read_frame(reader: &mut OwnedReadHalf) -> Option<Frame> {
    let mut header = [0u8; Frame::HEADER_SIZE];
    reader.read_exact(&mut header).await.ok()?;
    let header = decode_header(&mut &header[..]).ok()?;

    let mut payload = vec![0u8; header.length];
    reader.read_exact(&mut payload).await.ok()?;

    Some(Frame {
        message_type: header.message_type,
        flags: header.flags,
        payload: Bytes::from(payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use intercom_protocol::{decode_frame, FrameFlags};
    use tokio::net::TcpStream;

    async fn read_reply(stream: &mut TcpStream) -> Frame {
        let mut header = [0u8; Frame::HEADER_SIZE];
        stream.read_exact(&mut header).await.unwrap();
        let length = usize::from(u16::from_le_bytes([header[2], header[3]]));
        let mut buf = header.to_vec();
        buf.resize(Frame::HEADER_SIZE + length, 0);
        stream
            .read_exact(&mut buf[Frame::HEADER_SIZE..])
            .await
            .unwrap();
        decode_frame(&mut &buf[..]).unwrap()
    }

    async fn send(stream: &mut TcpStream, frame: Frame) {
        stream
            .write_all(&encode_frame(&frame).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ring_mode_rings_then_confirms_answer() {
        let endpoint = MockEndpoint::builder().mode(AnswerMode::Ring).start().await;
        let mut stream = TcpStream::connect(("127.0.0.1", endpoint.port()))
            .await
            .unwrap();

        send(&mut stream, Frame::start(FrameFlags::NONE, "Hub")).await;
        assert_eq!(read_reply(&mut stream).await.message_type, MessageType::Ring);

        send(&mut stream, Frame::control(MessageType::Answer)).await;
        assert_eq!(
            read_reply(&mut stream).await.message_type,
            MessageType::Answer
        );

        let start = endpoint.wait_for_frame(MessageType::Start).await;
        assert_eq!(start.payload, Bytes::from_static(b"Hub"));
    }

    #[tokio::test]
    async fn test_no_ring_start_is_answered_in_any_mode() {
        let endpoint = MockEndpoint::builder()
            .mode(AnswerMode::Silent)
            .start()
            .await;
        let mut stream = TcpStream::connect(("127.0.0.1", endpoint.port()))
            .await
            .unwrap();

        send(&mut stream, Frame::start(FrameFlags::NO_RING, "Porch")).await;
        assert_eq!(read_reply(&mut stream).await.message_type, MessageType::Pong);
    }

    #[tokio::test]
    async fn test_decline_mode_sends_busy() {
        let endpoint = MockEndpoint::builder()
            .mode(AnswerMode::Decline)
            .start()
            .await;
        let mut stream = TcpStream::connect(("127.0.0.1", endpoint.port()))
            .await
            .unwrap();

        send(&mut stream, Frame::start(FrameFlags::NONE, "Hub")).await;
        let reply = read_reply(&mut stream).await;
        assert_eq!(reply.message_type, MessageType::Error);
        assert_eq!(ErrorCode::from_payload(&reply.payload), ErrorCode::Busy);
    }

    #[tokio::test]
    async fn test_records_frames_and_counts_connections() {
        let endpoint = MockEndpoint::start().await;
        let mut stream = TcpStream::connect(("127.0.0.1", endpoint.port()))
            .await
            .unwrap();
        endpoint.wait_for_connections(1).await;

        send(&mut stream, Frame::audio(Bytes::from_static(&[1, 2]))).await;
        send(&mut stream, Frame::audio(Bytes::from_static(&[3, 4]))).await;

        endpoint.wait_for_frames(MessageType::Audio, 2).await;
        assert_eq!(
            endpoint.audio_received(),
            vec![Bytes::from_static(&[1, 2]), Bytes::from_static(&[3, 4])]
        );
    }

    #[tokio::test]
    async fn test_send_silence_is_one_chunk() {
        let endpoint = MockEndpoint::start().await;
        let mut stream = TcpStream::connect(("127.0.0.1", endpoint.port()))
            .await
            .unwrap();
        endpoint.wait_for_connections(1).await;

        let sent = endpoint.send_silence().await;
        let frame = read_reply(&mut stream).await;
        assert_eq!(frame.message_type, MessageType::Audio);
        assert_eq!(frame.payload.len(), intercom_protocol::audio::AUDIO_CHUNK_SIZE);
        assert_eq!(frame.payload, sent);
    }
}
