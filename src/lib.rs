//! # wsgate
//! Upgrades an HTTP/1.1 request/response exchange into a full-duplex WebSocket connection (RFC 6455).
//!
//! The crate covers the part of a WebSocket server that sits between an accepted transport and the
//! application:
//!
//! - deciding whether an exchange can still be upgraded ([`HttpExchange::can_upgrade`]),
//! - refusing the upgrade once response bytes were committed ([`ResponseState`]),
//! - the opening handshake and the `Sec-WebSocket-Accept` derivation ([`handshake`]),
//! - the frame codec ([`codec`], [`frame`]),
//! - a [`WebSocket`] whose send and receive paths progress independently.
//!
//! Accepting TCP connections, TLS termination and HTTP routing are left to the caller. Extension
//! negotiation (permessage-deflate, sub-protocols) is not supported; frames with reserved bits set are
//! rejected.
//!
//! # Features
//! - `logging`: Enables debug logging for the handshake, close handshake and protocol failures using the
//!   `log` crate.
//! - `simd`: Uses `simdutf8` to validate text messages returned by [`WebSocket::receive_message`].
//!
//! # Server Example
//! ```no_run
//! use tokio::net::TcpListener;
//! use wsgate::{HttpExchange, MessageType};
//!
//! #[tokio::main]
//! async fn main() -> wsgate::Result<()> {
//!     let listener = TcpListener::bind("127.0.0.1:8080").await?;
//!     let (stream, _) = listener.accept().await?;
//!
//!     let mut exchange = HttpExchange::read_request(stream).await?;
//!     if !exchange.is_websocket_request() {
//!         exchange.write_body(b"Hello World").await?;
//!         exchange.finish().await?;
//!         return Ok(());
//!     }
//!
//!     let ws = exchange.accept_websocket().await?;
//!     let mut buf = [0u8; 1024];
//!     loop {
//!         let result = ws.receive(&mut buf).await?;
//!         if result.message_type == MessageType::Close {
//!             break;
//!         }
//!         ws.send(&buf[..result.count], result.message_type, result.end_of_message)
//!             .await?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Client Example
//! ```no_run
//! use wsgate::{close::CloseCode, MessageType, WebSocket};
//!
//! #[tokio::main]
//! async fn main() -> wsgate::Result<()> {
//!     let ws = WebSocket::connect("ws://127.0.0.1:8080/".parse()?).await?;
//!     ws.send(b"ping", MessageType::Text, true).await?;
//!
//!     let message = ws.receive_message().await?;
//!     assert_eq!(&message.payload[..], b"ping");
//!
//!     ws.close(CloseCode::Normal, "bye").await
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

mod exchange;
mod mask;
mod response;
mod socket;

pub mod close;
pub mod codec;
pub mod frame;
pub mod handshake;

use std::sync::Arc;

use thiserror::Error;

pub use exchange::HttpExchange;
pub use handshake::{UpgradeDecision, UpgradeRefusal};
pub use response::ResponseState;
pub use socket::*;

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Represents errors that can occur while negotiating or running a WebSocket connection.
///
/// The variants fall into a few families with different consequences:
///
/// - Negotiation errors ([`is_negotiation_error`](Self::is_negotiation_error)): the request is not a
///   valid upgrade request. The exchange is untouched and can still produce an ordinary HTTP response.
/// - State errors ([`is_state_error`](Self::is_state_error)): the exchange can no longer be upgraded
///   because response bytes were committed or the upgrade already happened. These are usage errors.
/// - Protocol errors ([`is_protocol_error`](Self::is_protocol_error)): the peer violated RFC 6455. The
///   connection sends a Close frame and fails.
/// - Transport errors: I/O failures, timeouts and closed connections. The connection fails.
///
/// Once a connection failed every subsequent operation returns a clone of the first error, which is why
/// the I/O and hyper errors are held behind an [`Arc`].
#[derive(Error, Debug, Clone)]
pub enum WebSocketError {
    /// The request does not ask for a WebSocket upgrade: the `Upgrade` header does not list
    /// `websocket`, the `Connection` header does not list `upgrade`, or the request is older than
    /// HTTP/1.1.
    #[error("Not a WebSocket upgrade request")]
    NotUpgradeRequest,

    /// Occurs during handshake when the required "Sec-WebSocket-Key" header is missing from
    /// the client request.
    #[error("Sec-WebSocket-Key header is missing")]
    MissingSecWebSocketKey,

    /// Returned when the "Sec-WebSocket-Version" header is missing or not set to 13.
    #[error("Sec-Websocket-Version must be 13")]
    InvalidSecWebsocketVersion,

    /// The response headers or body were already written, so the exchange cannot switch protocols.
    #[error("Response already committed, the exchange cannot be upgraded")]
    AlreadyCommitted,

    /// The exchange was already upgraded; its transport belongs to a [`WebSocket`].
    #[error("Exchange was already upgraded")]
    AlreadyUpgraded,

    /// Occurs when receiving a WebSocket fragment that violates RFC 6455,
    /// such as receiving a new data frame before completing the previous message.
    #[error("Invalid fragment")]
    InvalidFragment,

    /// Occurs when receiving a continuation frame without a preceding initial frame.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// Indicates that reserved bits in the WebSocket frame header are set when they
    /// should be 0, as no extension was negotiated.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// Occurs when a control frame (ping, pong, or close) is received with the FIN bit
    /// not set. RFC 6455 requires that control frames must not be fragmented.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame carries more than 125 bytes of payload.
    #[error("Control frame too large")]
    ControlFrameTooLarge,

    /// Indicates receipt of a frame with an opcode outside the ones defined by RFC 6455.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// A server received a frame that was not masked by the client.
    #[error("Client frames must be masked")]
    UnmaskedFrame,

    /// A client received a frame that was masked by the server.
    #[error("Server frames must not be masked")]
    MaskedFrame,

    /// Occurs when a received frame's payload length, or an assembled message, exceeds the
    /// configured maximum. This helps prevent memory exhaustion attacks.
    #[error("Frame too large")]
    FrameTooLarge,

    /// Indicates that a received close frame has a payload of 1 byte (close frames must be either
    /// empty or at least 2 bytes).
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// Occurs when a close frame contains a status code that may not appear on the wire.
    #[error("Invalid close code")]
    InvalidCloseCode,

    /// Indicates that a text message or close frame reason contains invalid UTF-8 data.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// Returned when attempting to perform operations on a closed WebSocket connection.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The peer did not answer our Close frame in time.
    #[error("Timed out waiting for the close handshake")]
    CloseTimeout,

    /// A send was abandoned after part of a frame was handed to the transport. The peer's view of
    /// the stream is corrupted and the connection cannot be used anymore.
    #[error("A frame was only partially written")]
    IncompleteFrame,

    /// The connection was torn down locally with [`WebSocket::abort`].
    #[error("Connection aborted")]
    Aborted,

    /// A second receive was started while another one is still in flight.
    #[error("Another receive operation is already in progress")]
    ConcurrentReceive,

    /// A send tried to change the message type before the current message was finished.
    #[error("A message of another type is still in progress")]
    MessageInProgress,

    /// Only text and binary messages can be sent; use [`WebSocket::close`] to close.
    #[error("Invalid message type for send")]
    InvalidMessageType,

    /// The operation was cancelled through its cancellation token before it touched the wire.
    #[error("Operation cancelled")]
    Cancelled,

    /// Returned when receiving an HTTP status code other than 101 during the client handshake.
    #[error("Invalid status code: {0}")]
    InvalidStatusCode(u16),

    /// Indicates that the HTTP "Upgrade" header of the handshake response is missing or does not
    /// contain "websocket".
    #[error("Invalid upgrade header")]
    InvalidUpgradeHeader,

    /// Indicates that the HTTP "Connection" header of the handshake response is missing or does not
    /// contain "upgrade".
    #[error("Invalid connection header")]
    InvalidConnectionHeader,

    /// The server answered with a "Sec-WebSocket-Accept" value that does not match our key.
    #[error("Invalid Sec-WebSocket-Accept header")]
    InvalidSecWebSocketAccept,

    /// Returned when attempting to establish a WebSocket connection with an unsupported URL.
    /// Only "ws://" URLs with a host are dialed directly.
    #[error("Invalid http scheme")]
    InvalidHttpScheme,

    /// The request head read from the transport is not valid HTTP/1.x.
    #[error("Invalid HTTP request: {0}")]
    InvalidHttpRequest(String),

    /// The request head exceeds the maximum accepted size.
    #[error("HTTP request head too large")]
    RequestHeadTooLarge,

    /// Wraps errors from URL parsing that may occur when processing WebSocket URLs.
    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    /// Wraps standard I/O errors that may occur during WebSocket communication,
    /// such as connection resets or unexpected end of stream.
    #[error(transparent)]
    IoError(Arc<std::io::Error>),

    /// Wraps errors from the hyper HTTP library that may occur during the client handshake.
    #[error(transparent)]
    HTTPError(Arc<hyper::Error>),
}

impl WebSocketError {
    /// Returns `true` for errors that only mean "this is not a valid upgrade request".
    pub fn is_negotiation_error(&self) -> bool {
        matches!(
            self,
            Self::NotUpgradeRequest | Self::MissingSecWebSocketKey | Self::InvalidSecWebsocketVersion
        )
    }

    /// Returns `true` for upgrade attempts on an exchange that can no longer switch protocols.
    pub fn is_state_error(&self) -> bool {
        matches!(self, Self::AlreadyCommitted | Self::AlreadyUpgraded)
    }

    /// Returns `true` for violations of the framing rules by the peer.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidFragment
                | Self::InvalidContinuationFrame
                | Self::ReservedBitsNotZero
                | Self::ControlFrameFragmented
                | Self::ControlFrameTooLarge
                | Self::InvalidOpCode(_)
                | Self::UnmaskedFrame
                | Self::MaskedFrame
                | Self::FrameTooLarge
                | Self::InvalidCloseFrame
                | Self::InvalidCloseCode
                | Self::InvalidUTF8
        )
    }
}

impl From<std::io::Error> for WebSocketError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(Arc::new(err))
    }
}

impl From<hyper::Error> for WebSocketError {
    fn from(err: hyper::Error) -> Self {
        Self::HTTPError(Arc::new(err))
    }
}
