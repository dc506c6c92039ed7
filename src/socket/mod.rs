//! Full-duplex WebSocket connection over an upgraded transport.

mod client;
mod options;
mod split;

use std::{
    fmt,
    future::Future,
    io,
    ops::{Deref, DerefMut},
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
    time::Duration,
};

use bytes::{Buf, Bytes, BytesMut};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use pin_project::pin_project;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::watch,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};

use crate::{
    close::CloseCode,
    codec::{Decoder, Encoder},
    frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD},
    Result, WebSocketError,
};

pub use options::Options;
use split::{ReadHalf, WriteHalf};

/// The maximum allowed payload size for reading, set to 1 MiB.
///
/// Frames with a payload size larger than this limit will be rejected to ensure memory safety
/// and prevent excessively large messages from impacting performance.
pub const MAX_PAYLOAD_READ: usize = 1024 * 1024;

/// The maximum size of a message reassembled by [`WebSocket::receive_message`], set to 2 MiB.
pub const MAX_READ_BUFFER: usize = 2 * 1024 * 1024;

/// How long [`WebSocket::close`] waits for the peer's Close frame by default.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Parameters a connection runs with, resolved from [`Options`].
#[derive(Debug, Clone)]
pub(crate) struct Negotiation {
    pub(crate) max_payload_read: usize,
    pub(crate) max_read_buffer: usize,
    pub(crate) utf8: bool,
    pub(crate) close_timeout: Duration,
}

/// The role the WebSocket stream is taking.
///
/// When a server role is taken the frames will not be masked, unlike
/// the client role, in which frames are masked.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

// ================== HttpStream ====================

/// Any transport a server exchange can hand over.
pub(crate) trait RawStream: AsyncRead + AsyncWrite + Send {}

impl<T> RawStream for T where T: AsyncRead + AsyncWrite + Send {}

/// The transport under a WebSocket after the protocol switch.
#[pin_project(project = HttpStreamProj)]
pub(crate) enum HttpStream {
    /// A connection upgraded by hyper's client.
    Hyper(#[pin] TokioIo<Upgraded>),
    /// A transport taken over from an [`HttpExchange`](crate::HttpExchange), with the bytes the
    /// exchange read past the request head.
    Raw {
        prefix: Bytes,
        #[pin]
        io: Pin<Box<dyn RawStream>>,
    },
}

impl HttpStream {
    pub(crate) fn raw<S>(io: S, prefix: Bytes) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::Raw {
            prefix,
            io: Box::pin(io),
        }
    }
}

impl From<TokioIo<Upgraded>> for HttpStream {
    fn from(value: TokioIo<Upgraded>) -> Self {
        Self::Hyper(value)
    }
}

impl AsyncRead for HttpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            HttpStreamProj::Hyper(stream) => stream.poll_read(cx, buf),
            HttpStreamProj::Raw { prefix, io } => {
                if prefix.has_remaining() {
                    let n = prefix.len().min(buf.remaining());
                    buf.put_slice(&prefix[..n]);
                    prefix.advance(n);
                    return Poll::Ready(Ok(()));
                }
                io.poll_read(cx, buf)
            }
        }
    }
}

impl AsyncWrite for HttpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            HttpStreamProj::Hyper(stream) => stream.poll_write(cx, buf),
            HttpStreamProj::Raw { io, .. } => io.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            HttpStreamProj::Hyper(stream) => stream.poll_flush(cx),
            HttpStreamProj::Raw { io, .. } => io.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            HttpStreamProj::Hyper(stream) => stream.poll_shutdown(cx),
            HttpStreamProj::Raw { io, .. } => io.poll_shutdown(cx),
        }
    }
}

// ================== Messages ====================

/// Type of a WebSocket message as seen by the application.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageType {
    Text,
    Binary,
    /// The peer sent a Close frame. Only produced by receive operations.
    Close,
}

impl MessageType {
    /// Opcode of the first frame of a message, `None` for [`MessageType::Close`].
    pub(crate) fn opcode(self) -> Option<OpCode> {
        match self {
            Self::Text => Some(OpCode::Text),
            Self::Binary => Some(OpCode::Binary),
            Self::Close => None,
        }
    }
}

/// Result of [`WebSocket::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveResult {
    /// Number of bytes written into the caller's buffer.
    pub count: usize,
    pub message_type: MessageType,
    /// `true` when the last byte of the message was delivered by this call.
    pub end_of_message: bool,
    /// Status code of the peer's Close frame, if it carried one.
    pub close_status: Option<CloseCode>,
    /// Reason of the peer's Close frame, if it carried one.
    pub close_description: Option<String>,
}

impl ReceiveResult {
    pub(crate) fn data(count: usize, message_type: MessageType, end_of_message: bool) -> Self {
        Self {
            count,
            message_type,
            end_of_message,
            close_status: None,
            close_description: None,
        }
    }

    fn close(close_status: Option<CloseCode>, close_description: Option<String>) -> Self {
        Self {
            count: 0,
            message_type: MessageType::Close,
            end_of_message: true,
            close_status,
            close_description,
        }
    }
}

/// A complete message returned by [`WebSocket::receive_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: MessageType,
    pub payload: Bytes,
    pub close_status: Option<CloseCode>,
    pub close_description: Option<String>,
}

impl Message {
    /// Returns the payload as a string for text messages.
    pub fn as_text(&self) -> Option<&str> {
        if self.message_type != MessageType::Text {
            return None;
        }
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WebSocketState {
    Open,
    /// We sent a Close frame and wait for the peer's.
    CloseSent,
    /// The peer sent a Close frame that was not answered yet.
    CloseReceived,
    /// The close handshake finished or timed out and the transport was released.
    Closed,
    /// The connection was aborted locally or failed.
    Aborted,
}

// ================== WebSocket ====================

#[derive(Default)]
struct Lifecycle {
    close_sent: bool,
    close_received: bool,
    /// The transport was (or is being) dropped.
    released: bool,
    aborted: bool,
    /// First error that failed the connection.
    failure: Option<WebSocketError>,
}

struct Shared {
    role: Role,
    negotiation: Negotiation,
    reader: tokio::sync::Mutex<ReadHalf>,
    writer: tokio::sync::Mutex<WriteHalf>,
    lifecycle: Mutex<Lifecycle>,
    /// Flips to `true` once the peer's Close frame was read.
    peer_closed: watch::Sender<bool>,
    /// Cancelled when the transport is released, waking every pending operation.
    shutdown: CancellationToken,
}

/// WebSocket connection for both clients and servers.
///
/// `WebSocket` is a cheap handle: clones share the same connection, so one task can sit in
/// [`receive`](Self::receive) while others [`send`](Self::send). The receive and send paths are guarded
/// by separate locks and never wait on each other. Frames from concurrent senders are never
/// interleaved on the wire.
///
/// Pings from the peer are answered automatically, pongs are swallowed, and a Close from the peer is
/// echoed and reported to the receiver as [`MessageType::Close`].
///
/// Once a transport or protocol error occurred the connection is failed: a protocol violation is
/// answered with a Close frame (1002, 1007 or 1009), the transport is dropped and every later
/// operation returns a clone of the first error.
///
/// # Example
/// ```no_run
/// use wsgate::{MessageType, WebSocket};
///
/// #[tokio::main]
/// async fn main() -> wsgate::Result<()> {
///     let ws = WebSocket::connect("ws://127.0.0.1:8080/".parse()?).await?;
///
///     let reader = ws.clone();
///     tokio::spawn(async move {
///         let mut buf = vec![0u8; 4096];
///         while let Ok(result) = reader.receive(&mut buf).await {
///             if result.message_type == MessageType::Close {
///                 break;
///             }
///         }
///     });
///
///     ws.send(b"hello", MessageType::Text, true).await
/// }
/// ```
#[derive(Clone)]
pub struct WebSocket {
    shared: Arc<Shared>,
}

impl fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocket")
            .field("role", &self.shared.role)
            .field("state", &self.state())
            .finish()
    }
}

impl WebSocket {
    /// Creates a new connection after an HTTP upgrade.
    pub(crate) fn new(role: Role, stream: HttpStream, negotiation: Negotiation) -> Self {
        let (read, write) = tokio::io::split(stream);
        let reader = FramedRead::new(read, Decoder::new(role, negotiation.max_payload_read));
        let writer = FramedWrite::new(write, Encoder::new(role));
        let (peer_closed, _) = watch::channel(false);

        #[cfg(feature = "logging")]
        log::debug!("{role} connection established");

        Self {
            shared: Arc::new(Shared {
                role,
                negotiation,
                reader: tokio::sync::Mutex::new(ReadHalf::new(reader)),
                writer: tokio::sync::Mutex::new(WriteHalf::new(writer)),
                lifecycle: Mutex::new(Lifecycle::default()),
                peer_closed,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Returns the role this endpoint plays.
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> WebSocketState {
        let lifecycle = self.lifecycle();
        if lifecycle.aborted || lifecycle.failure.is_some() {
            WebSocketState::Aborted
        } else if lifecycle.released || (lifecycle.close_sent && lifecycle.close_received) {
            WebSocketState::Closed
        } else if lifecycle.close_sent {
            WebSocketState::CloseSent
        } else if lifecycle.close_received {
            WebSocketState::CloseReceived
        } else {
            WebSocketState::Open
        }
    }

    // ================== Receive ====================

    /// Receives the next chunk of data into `buf`.
    ///
    /// Suspends until a data frame or the peer's Close frame arrives. At most `buf.len()` bytes are
    /// copied; the rest of the frame is kept and returned first by the next call.
    /// `end_of_message` is only `true` once the final fragment of a message was fully delivered.
    ///
    /// Only one receive may be in progress at a time; a concurrent call fails immediately with
    /// [`WebSocketError::ConcurrentReceive`].
    ///
    /// Dropping the returned future cancels the receive without losing data: the partially decoded
    /// frame stays buffered.
    pub async fn receive(&self, buf: &mut [u8]) -> Result<ReceiveResult> {
        self.check_readable()?;
        let mut reader = self
            .shared
            .reader
            .try_lock()
            .map_err(|_| WebSocketError::ConcurrentReceive)?;

        self.guarded(async move {
            loop {
                if let Some(result) = reader.take_pending(buf) {
                    return Ok(result);
                }
                if let Some(close) = self.next_data(&mut reader).await? {
                    return Ok(close);
                }
            }
        })
        .await
    }

    /// Like [`receive`](Self::receive), but gives up with [`WebSocketError::Cancelled`] when `cancel`
    /// fires. The connection stays usable.
    pub async fn receive_cancellable(
        &self,
        buf: &mut [u8],
        cancel: &CancellationToken,
    ) -> Result<ReceiveResult> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WebSocketError::Cancelled),
            result = self.receive(buf) => result,
        }
    }

    /// Receives a complete message, reassembling fragments.
    ///
    /// The message may not exceed the configured `max_read_buffer`. When UTF-8 validation is enabled
    /// in [`Options`], text messages are validated.
    pub async fn receive_message(&self) -> Result<Message> {
        self.check_readable()?;
        let mut reader = self
            .shared
            .reader
            .try_lock()
            .map_err(|_| WebSocketError::ConcurrentReceive)?;

        self.guarded(async move {
            let max_read_buffer = self.shared.negotiation.max_read_buffer;
            let mut payload = BytesMut::new();

            loop {
                let Some((chunk, message_type, fin)) = reader.take_pending_frame() else {
                    if let Some(close) = self.next_data(&mut reader).await? {
                        return Ok(Message {
                            message_type: MessageType::Close,
                            payload: Bytes::new(),
                            close_status: close.close_status,
                            close_description: close.close_description,
                        });
                    }
                    continue;
                };

                if payload.len() + chunk.len() > max_read_buffer {
                    return Err(self.fail(&mut reader, WebSocketError::FrameTooLarge).await);
                }
                payload.extend_from_slice(&chunk);

                if !fin {
                    continue;
                }

                if message_type == MessageType::Text
                    && self.shared.negotiation.utf8
                    && !is_valid_utf8(&payload)
                {
                    return Err(self.fail(&mut reader, WebSocketError::InvalidUTF8).await);
                }

                return Ok(Message {
                    message_type,
                    payload: payload.freeze(),
                    close_status: None,
                    close_description: None,
                });
            }
        })
        .await
    }

    /// Reads frames until a data frame is buffered in `reader` or the peer's Close arrives.
    ///
    /// Returns `Some` with the close result in the latter case.
    async fn next_data(&self, reader: &mut ReadHalf) -> Result<Option<ReceiveResult>> {
        loop {
            let frame = match reader.next_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Err(self.fail(reader, WebSocketError::ConnectionClosed).await),
                Err(err) => return Err(self.fail(reader, err).await),
            };

            match frame.opcode {
                OpCode::Ping => {
                    if let Err(err) = self.on_ping(frame).await {
                        reader.release();
                        return Err(err);
                    }
                }
                OpCode::Pong => {}
                OpCode::Close => return self.on_close(reader, frame).await.map(Some),
                _ => {
                    return match reader.on_data_frame(frame) {
                        Ok(()) => Ok(None),
                        Err(err) => Err(self.fail(reader, err).await),
                    };
                }
            }
        }
    }

    async fn on_ping(&self, frame: Frame) -> Result<()> {
        // once our Close is out no other frame may follow it
        if self.close_sent() {
            return Ok(());
        }

        let mut writer = self.lock_writer().await;
        match writer.send_frame(Frame::pong(&frame.payload)).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail_write(&mut writer, err)),
        }
    }

    async fn on_close(&self, reader: &mut ReadHalf, frame: Frame) -> Result<ReceiveResult> {
        let (code, reason) = match parse_close(&frame) {
            Ok(parsed) => parsed,
            Err(err) => return Err(self.fail(reader, err).await),
        };

        #[cfg(feature = "logging")]
        log::debug!(
            "{} received close frame (code={:?}, reason={:?})",
            self.shared.role,
            code,
            reason
        );

        let echo = self.mark_close_received();

        let _ = tokio::time::timeout(self.shared.negotiation.close_timeout, async {
            let mut writer = self.lock_writer().await;
            if echo {
                let reply = match code {
                    Some(code) => Frame::close(code, ""),
                    None => Frame::close_raw(b""),
                };
                let _ = writer.send_frame(reply).await;
            }
            let _ = writer.shutdown().await;
            writer.release();
        })
        .await;

        // a concurrent close() may only finish once the echo is out
        self.shared.peer_closed.send_replace(true);
        reader.release();
        self.release_now();

        Ok(ReceiveResult::close(code, reason))
    }

    // ================== Send ====================

    /// Sends `payload` as one frame of a message of type `message_type`.
    ///
    /// A message may be sent in several calls: every call but the last passes
    /// `end_of_message = false`, and all of them must use the same message type
    /// ([`WebSocketError::MessageInProgress`] otherwise). [`MessageType::Close`] is rejected with
    /// [`WebSocketError::InvalidMessageType`]; use [`close`](Self::close).
    ///
    /// Concurrent sends are serialized. Dropping the future while it waits for its turn has no effect
    /// on the connection. Dropping it while the frame is being written fails the connection right away
    /// with [`WebSocketError::IncompleteFrame`] and wakes every pending operation.
    pub async fn send(
        &self,
        payload: &[u8],
        message_type: MessageType,
        end_of_message: bool,
    ) -> Result<()> {
        if message_type == MessageType::Close {
            return Err(WebSocketError::InvalidMessageType);
        }
        self.check_writable()?;

        self.guarded(async {
            let mut writer = self.lock_writer().await;
            self.check_writable()?;

            match writer.send_data(payload, message_type, end_of_message).await {
                Ok(()) => Ok(()),
                Err(err @ WebSocketError::MessageInProgress) => Err(err),
                Err(err) => Err(self.fail_write(&mut writer, err)),
            }
        })
        .await
    }

    /// Like [`send`](Self::send), but gives up with [`WebSocketError::Cancelled`] when `cancel` fires.
    ///
    /// If the frame was already partially written the connection is failed, since the peer would
    /// otherwise see a truncated frame.
    pub async fn send_cancellable(
        &self,
        payload: &[u8],
        message_type: MessageType,
        end_of_message: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WebSocketError::Cancelled),
            result = self.send(payload, message_type, end_of_message) => result,
        }
    }

    /// Sends a Ping frame. The peer's Pong is consumed by the receive path.
    pub async fn ping(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlFrameTooLarge);
        }
        self.check_writable()?;

        self.guarded(async {
            let mut writer = self.lock_writer().await;
            match writer.send_frame(Frame::ping(payload)).await {
                Ok(()) => Ok(()),
                Err(err) => Err(self.fail_write(&mut writer, err)),
            }
        })
        .await
    }

    // ================== Close ====================

    /// Performs the close handshake.
    ///
    /// Sends a Close frame with `code` and `reason` unless one was already sent, then waits for the
    /// peer's Close frame and releases the transport. If another task is receiving, that task gets the
    /// peer's Close; otherwise incoming data is discarded while waiting.
    ///
    /// The wait is bounded by the close timeout of [`Options`]. On expiry the transport is released
    /// anyway and [`WebSocketError::CloseTimeout`] is returned.
    ///
    /// Calling `close` on a connection that is already closed, including one closed by the peer, returns
    /// `Ok(())`.
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<()> {
        if let Some(outcome) = self.close_outcome() {
            return outcome;
        }
        if reason.len() > MAX_CONTROL_PAYLOAD - 2 {
            return Err(WebSocketError::ControlFrameTooLarge);
        }
        if !code.is_allowed() {
            return Err(WebSocketError::InvalidCloseCode);
        }

        let handshake = self.guarded(async {
            if self.mark_close_sent() {
                let mut writer = self.lock_writer().await;
                if let Err(err) = writer.send_frame(Frame::close(code, reason)).await {
                    return Err(self.fail_write(&mut writer, err));
                }

                #[cfg(feature = "logging")]
                log::debug!("{} sent close frame ({code})", self.shared.role);
            }

            self.await_peer_close().await
        });

        match tokio::time::timeout(self.shared.negotiation.close_timeout, handshake).await {
            Ok(Ok(())) => {
                self.release_now();
                Ok(())
            }
            Ok(Err(err)) => self.close_outcome().unwrap_or(Err(err)),
            Err(_) => {
                #[cfg(feature = "logging")]
                log::warn!("{} close handshake timed out", self.shared.role);

                self.release_now();
                Err(WebSocketError::CloseTimeout)
            }
        }
    }

    async fn await_peer_close(&self) -> Result<()> {
        let mut peer_closed = self.shared.peer_closed.subscribe();

        loop {
            let closed = *peer_closed.borrow_and_update();
            if closed {
                return Ok(());
            }

            let mut reader = tokio::select! {
                changed = peer_closed.changed() => {
                    changed.map_err(|_| WebSocketError::ConnectionClosed)?;
                    continue;
                }
                reader = self.shared.reader.lock() => reader,
            };

            // nobody else is receiving; drain until the Close shows up
            loop {
                reader.discard_pending();
                if self.next_data(&mut reader).await?.is_some() {
                    return Ok(());
                }
            }
        }
    }

    /// Tears the connection down without a close handshake.
    ///
    /// Pending operations on other tasks return [`WebSocketError::Aborted`]. Calling `abort` on a
    /// connection that is already closed or failed does nothing.
    pub fn abort(&self) {
        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.released || lifecycle.failure.is_some() {
                return;
            }
            lifecycle.aborted = true;
        }

        #[cfg(feature = "logging")]
        log::debug!("{} connection aborted", self.shared.role);

        self.release_now();
    }

    // ================== Internals ====================

    async fn lock_writer(&self) -> WriterGuard<'_> {
        WriterGuard {
            ws: self,
            writer: self.shared.writer.lock().await,
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.shared
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `operation` unless the transport is released first.
    async fn guarded<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        let outcome = tokio::select! {
            biased;
            _ = self.shared.shutdown.cancelled() => None,
            result = operation => Some(result),
        };

        match outcome {
            Some(result) => result,
            None => {
                // the operation and any half it held are gone now
                self.release_now();
                Err(self.terminal_error())
            }
        }
    }

    fn terminal_error(&self) -> WebSocketError {
        let lifecycle = self.lifecycle();
        if let Some(err) = &lifecycle.failure {
            err.clone()
        } else if lifecycle.aborted {
            WebSocketError::Aborted
        } else {
            WebSocketError::ConnectionClosed
        }
    }

    fn check_readable(&self) -> Result<()> {
        let lifecycle = self.lifecycle();
        if let Some(err) = &lifecycle.failure {
            return Err(err.clone());
        }
        if lifecycle.aborted {
            return Err(WebSocketError::Aborted);
        }
        if lifecycle.close_received || lifecycle.released {
            return Err(WebSocketError::ConnectionClosed);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        let lifecycle = self.lifecycle();
        if let Some(err) = &lifecycle.failure {
            return Err(err.clone());
        }
        if lifecycle.aborted {
            return Err(WebSocketError::Aborted);
        }
        if lifecycle.close_sent || lifecycle.released {
            return Err(WebSocketError::ConnectionClosed);
        }
        Ok(())
    }

    fn close_sent(&self) -> bool {
        self.lifecycle().close_sent
    }

    /// Returns `true` if the caller is the one that must send the Close frame.
    fn mark_close_sent(&self) -> bool {
        let mut lifecycle = self.lifecycle();
        let first = !lifecycle.close_sent;
        lifecycle.close_sent = true;
        first
    }

    /// Records the peer's Close. Returns `true` if we still have to answer it.
    fn mark_close_received(&self) -> bool {
        let mut lifecycle = self.lifecycle();
        lifecycle.close_received = true;
        let echo = !lifecycle.close_sent;
        lifecycle.close_sent = true;
        echo
    }

    /// `Some` once `close` has nothing left to do.
    fn close_outcome(&self) -> Option<Result<()>> {
        let lifecycle = self.lifecycle();
        if let Some(err) = &lifecycle.failure {
            Some(Err(err.clone()))
        } else if lifecycle.aborted {
            Some(Err(WebSocketError::Aborted))
        } else if lifecycle.released {
            Some(Ok(()))
        } else {
            None
        }
    }

    /// Stores `err` as the reason the connection failed.
    ///
    /// Returns `None` if the connection already ended, in which case the earlier outcome stands.
    fn record_failure(&self, err: WebSocketError) -> Option<WebSocketError> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.failure.is_some() || lifecycle.released || lifecycle.aborted {
            return None;
        }
        lifecycle.failure = Some(err.clone());
        Some(err)
    }

    /// Fails the connection from the receive path.
    ///
    /// Protocol violations are reported to the peer with a Close frame before the transport is
    /// dropped.
    async fn fail(&self, reader: &mut ReadHalf, err: WebSocketError) -> WebSocketError {
        let Some(err) = self.record_failure(err) else {
            reader.release();
            return self.terminal_error();
        };

        #[cfg(feature = "logging")]
        log::debug!("{} connection failed: {err}", self.shared.role);

        if let Some(code) = failure_close_code(&err) {
            let _ = tokio::time::timeout(self.shared.negotiation.close_timeout, async {
                let mut writer = self.lock_writer().await;
                if writer.send_frame(Frame::close(code, "")).await.is_ok() {
                    self.lifecycle().close_sent = true;
                }
                let _ = writer.shutdown().await;
                writer.release();
            })
            .await;
        }

        reader.release();
        self.release_now();
        err
    }

    /// Fails the connection from the send path. Nothing more can be written, so no Close is sent.
    fn fail_write(&self, writer: &mut WriteHalf, err: WebSocketError) -> WebSocketError {
        let err = self
            .record_failure(err)
            .unwrap_or_else(|| self.terminal_error());

        #[cfg(feature = "logging")]
        log::debug!("{} send path failed: {err}", self.shared.role);

        writer.release();
        self.release_now();
        err
    }

    /// Marks the transport released, wakes pending operations and drops every half that is not in use.
    /// Halves held by a pending operation are dropped when that operation returns.
    fn release_now(&self) {
        self.lifecycle().released = true;
        self.shared.shutdown.cancel();

        if let Ok(mut reader) = self.shared.reader.try_lock() {
            reader.release();
        }
        if let Ok(mut writer) = self.shared.writer.try_lock() {
            writer.release();
        }
    }
}

/// Exclusive access to the write path.
///
/// Dropping the guard while a frame is only partially written fails the connection with
/// [`WebSocketError::IncompleteFrame`]: the peer would otherwise wait on a truncated frame.
struct WriterGuard<'a> {
    ws: &'a WebSocket,
    writer: tokio::sync::MutexGuard<'a, WriteHalf>,
}

impl Deref for WriterGuard<'_> {
    type Target = WriteHalf;

    fn deref(&self) -> &Self::Target {
        &self.writer
    }
}

impl DerefMut for WriterGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.writer
    }
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        if self.writer.is_poisoned() {
            self.ws
                .fail_write(&mut self.writer, WebSocketError::IncompleteFrame);
        }
    }
}

/// Validates a Close frame payload and extracts its code and reason.
fn parse_close(frame: &Frame) -> Result<(Option<CloseCode>, Option<String>)> {
    match frame.payload.len() {
        0 => Ok((None, None)),
        1 => Err(WebSocketError::InvalidCloseFrame),
        _ => {
            let code = frame
                .close_code()
                .ok_or(WebSocketError::InvalidCloseFrame)?;
            if !code.is_allowed() {
                return Err(WebSocketError::InvalidCloseCode);
            }
            let reason = frame.close_reason()?.map(str::to_owned);
            Ok((Some(code), reason))
        }
    }
}

/// Close code sent to the peer when the connection fails with `err`.
fn failure_close_code(err: &WebSocketError) -> Option<CloseCode> {
    match err {
        WebSocketError::FrameTooLarge => Some(CloseCode::Size),
        WebSocketError::InvalidUTF8 => Some(CloseCode::Invalid),
        err if err.is_protocol_error() => Some(CloseCode::Protocol),
        _ => None,
    }
}

#[inline]
fn is_valid_utf8(payload: &[u8]) -> bool {
    #[cfg(not(feature = "simd"))]
    return std::str::from_utf8(payload).is_ok();
    #[cfg(feature = "simd")]
    return simdutf8::basic::from_utf8(payload).is_ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_close_payloads() {
        assert_eq!(parse_close(&Frame::close_raw(b"")).unwrap(), (None, None));
        assert!(matches!(
            parse_close(&Frame::close_raw(b"\x03")),
            Err(WebSocketError::InvalidCloseFrame)
        ));

        let (code, reason) = parse_close(&Frame::close(CloseCode::Away, "gone")).unwrap();
        assert_eq!(code, Some(CloseCode::Away));
        assert_eq!(reason.as_deref(), Some("gone"));

        // 1006 is reserved for local use
        assert!(matches!(
            parse_close(&Frame::close_raw([0x03, 0xEE])),
            Err(WebSocketError::InvalidCloseCode)
        ));
        assert!(matches!(
            parse_close(&Frame::close_raw([0x03, 0xE8, 0xC3, 0x28])),
            Err(WebSocketError::InvalidUTF8)
        ));
    }

    #[test]
    fn test_failure_close_codes() {
        assert_eq!(
            failure_close_code(&WebSocketError::FrameTooLarge),
            Some(CloseCode::Size)
        );
        assert_eq!(
            failure_close_code(&WebSocketError::InvalidUTF8),
            Some(CloseCode::Invalid)
        );
        assert_eq!(
            failure_close_code(&WebSocketError::MaskedFrame),
            Some(CloseCode::Protocol)
        );
        assert_eq!(failure_close_code(&WebSocketError::ConnectionClosed), None);
        assert_eq!(failure_close_code(&WebSocketError::CloseTimeout), None);
    }

    #[tokio::test]
    async fn test_prefix_is_read_before_transport() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut peer, io) = tokio::io::duplex(64);
        peer.write_all(b" world").await.unwrap();
        drop(peer);

        let mut stream = HttpStream::raw(io, Bytes::from_static(b"hello"));
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn test_message_as_text() {
        let message = Message {
            message_type: MessageType::Text,
            payload: Bytes::from_static(b"hi"),
            close_status: None,
            close_description: None,
        };
        assert_eq!(message.as_text(), Some("hi"));

        let binary = Message {
            message_type: MessageType::Binary,
            ..message
        };
        assert_eq!(binary.as_text(), None);
    }
}
