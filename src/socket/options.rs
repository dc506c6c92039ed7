use std::time::Duration;

use super::{Negotiation, CLOSE_TIMEOUT, MAX_PAYLOAD_READ, MAX_READ_BUFFER};

/// Configuration options for a WebSocket connection.
///
/// `Options` can be passed to [`HttpExchange::accept_websocket_with_options`](crate::HttpExchange::accept_websocket_with_options)
/// on the server, or to [`WebSocket::connect_with_options`](super::WebSocket::connect_with_options) and
/// [`WebSocket::handshake`](super::WebSocket::handshake) on the client.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use wsgate::Options;
///
/// let options = Options::default()
///     .with_max_payload_read(64 * 1024)
///     .with_close_timeout(Duration::from_secs(1))
///     .with_utf8();
/// ```
#[derive(Clone, Debug, Default)]
pub struct Options {
    /// Maximum allowed payload size for a single incoming frame, in bytes.
    ///
    /// A frame announcing a larger payload fails the connection with a 1009 Close.
    ///
    /// Default: 1 MiB (1,048,576 bytes) as defined in [`MAX_PAYLOAD_READ`]
    pub max_payload_read: Option<usize>,

    /// Maximum size of a message reassembled by [`WebSocket::receive_message`](super::WebSocket::receive_message).
    ///
    /// Default: 2 MiB (2,097,152 bytes) as defined in [`MAX_READ_BUFFER`], or twice the
    /// configured `max_payload_read` value if that is set.
    pub max_read_buffer: Option<usize>,

    /// Flag to determine whether text messages should be validated as UTF-8.
    ///
    /// When set, [`WebSocket::receive_message`](super::WebSocket::receive_message) fails the connection
    /// with a 1007 Close if a text message is not valid UTF-8. Fragment-level reads through
    /// [`WebSocket::receive`](super::WebSocket::receive) are never validated, since a fragment may end in
    /// the middle of a code point.
    ///
    /// Default: `false`
    pub check_utf8: bool,

    /// How long [`WebSocket::close`](super::WebSocket::close) waits for the peer's Close frame.
    ///
    /// Default: 5 seconds as defined in [`CLOSE_TIMEOUT`]
    pub close_timeout: Option<Duration>,

    /// Sets `TCP_NODELAY` on sockets opened by [`WebSocket::connect`](super::WebSocket::connect).
    ///
    /// Default: `false`
    pub no_delay: bool,
}

impl Options {
    /// Sets the maximum allowed payload size for incoming frames.
    ///
    /// # Parameters
    /// - `size`: The maximum payload size in bytes.
    pub fn with_max_payload_read(self, size: usize) -> Self {
        Self {
            max_payload_read: Some(size),
            ..self
        }
    }

    /// Sets the maximum size of a reassembled message.
    ///
    /// # Parameters
    /// - `size`: The maximum buffer size in bytes.
    pub fn with_max_read_buffer(self, size: usize) -> Self {
        Self {
            max_read_buffer: Some(size),
            ..self
        }
    }

    /// Enables UTF-8 validation of text messages.
    pub fn with_utf8(self) -> Self {
        Self {
            check_utf8: true,
            ..self
        }
    }

    /// Bounds how long the close handshake may take.
    pub fn with_close_timeout(self, timeout: Duration) -> Self {
        Self {
            close_timeout: Some(timeout),
            ..self
        }
    }

    /// Sets `TCP_NODELAY` on client connections.
    pub fn with_no_delay(self) -> Self {
        Self {
            no_delay: true,
            ..self
        }
    }

    /// Resolves the options into the parameters a connection runs with.
    pub(crate) fn negotiate(&self) -> Negotiation {
        let max_read_buffer = self.max_read_buffer.unwrap_or(
            self.max_payload_read
                .map(|payload_read| payload_read.saturating_mul(2))
                .unwrap_or(MAX_READ_BUFFER),
        );

        Negotiation {
            max_payload_read: self.max_payload_read.unwrap_or(MAX_PAYLOAD_READ),
            max_read_buffer,
            utf8: self.check_utf8,
            close_timeout: self.close_timeout.unwrap_or(CLOSE_TIMEOUT),
        }
    }
}
