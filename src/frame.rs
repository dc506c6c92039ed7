//! # Frame
//!
//! The `frame` module implements WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//! Each frame is an atomic unit of data transmission; a message is one or more frames.
//!
//! ### Frame Binary Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! :                     Payload Data continued ...                :
//! +---------------------------------------------------------------+
//! ```
//!
//! Frames come in two categories:
//!
//! - **Data Frames**: `OpCode::Text`, `OpCode::Binary` and `OpCode::Continuation`.
//! - **Control Frames**: `OpCode::Close`, `OpCode::Ping` and `OpCode::Pong`. They are never
//!   fragmented and carry at most 125 bytes.
//!
//! Masking is decided by the [`Role`](crate::Role) of the sender, not by the frame: the
//! [`codec::Encoder`](crate::codec::Encoder) masks every frame a client sends and none of the frames a
//! server sends.
//!
//! ```rust
//! use wsgate::close::CloseCode;
//! use wsgate::frame::{Frame, OpCode};
//!
//! let text = Frame::text("Hello, WebSocket!");
//! let first = Frame::binary(vec![1, 2, 3]).with_fin(false);
//! let last = Frame::continuation(vec![4, 5]);
//! let close = Frame::close(CloseCode::Normal, "bye");
//!
//! assert_eq!(text.opcode, OpCode::Text);
//! assert!(!first.fin && last.fin);
//! assert_eq!(close.close_code(), Some(CloseCode::Normal));
//! ```
use bytes::BytesMut;

use crate::{close::CloseCode, mask, Result, WebSocketError};

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest frame header: 2 fixed bytes, 8 bytes of extended length and a 4-byte masking key.
pub const MAX_HEAD_SIZE: usize = 14;

/// WebSocket operation code (OpCode) that determines the semantic meaning and handling of a frame.
///
/// The numeric values for each OpCode are defined in [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8):
/// - Continuation = 0x0
/// - Text = 0x1
/// - Binary = 0x2
/// - Close = 0x8
/// - Ping = 0x9
/// - Pong = 0xA
///
/// The ranges 0x3-0x7 and 0xB-0xF are reserved and rejected.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` if the `OpCode` represents a control frame (`Close`, `Ping`, or `Pong`).
    ///
    /// Control frames cannot be fragmented, carry at most 125 bytes and are handled as soon as they
    /// arrive, even between the fragments of a data message.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// Represents a WebSocket frame, encapsulating the data and metadata for message transmission.
///
/// **Note: This low-level struct should rarely be used directly.** [`WebSocket`](crate::WebSocket)
/// builds and consumes frames on behalf of the application.
///
/// # Fields
/// - `fin`: Final fragment flag. When `true`, indicates this frame completes a message.
/// - `opcode`: Defines the frame type and interpretation (text, binary, control, etc).
/// - `mask`: Optional 32-bit XOR masking key, present on client-to-server frames while encoded.
/// - `payload`: Frame payload data. Frames produced by the decoder are already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Indicates if this is the final frame in a message.
    pub fin: bool,
    /// The opcode of the frame, defining its type.
    pub opcode: OpCode,
    /// The masking key for the frame, if any.
    mask: Option<[u8; 4]>,
    /// The payload of the frame, containing the actual data.
    pub payload: BytesMut,
}

impl Frame {
    /// Creates a new WebSocket `Frame`.
    ///
    /// # Parameters
    /// - `fin`: Indicates if this frame is the final fragment in a message.
    /// - `opcode`: The operation code of the frame.
    /// - `mask`: Optional 4-byte masking key. The payload is expected to be unmasked; the key is
    ///   applied when the frame is encoded.
    /// - `payload`: The frame payload data.
    pub fn new(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: impl Into<BytesMut>,
    ) -> Self {
        Self {
            fin,
            opcode,
            mask,
            payload: payload.into(),
        }
    }

    /// Creates a final text frame.
    pub fn text(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Text, None, payload.as_ref())
    }

    /// Creates a final binary frame.
    pub fn binary(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Binary, None, payload.as_ref())
    }

    /// Creates a final continuation frame. Use [`Frame::with_fin`] for middle fragments.
    pub fn continuation(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Continuation, None, payload.as_ref())
    }

    /// Creates a ping frame.
    pub fn ping(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Ping, None, payload.as_ref())
    }

    /// Creates a pong frame, usually echoing the payload of a ping.
    pub fn pong(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Pong, None, payload.as_ref())
    }

    /// Creates a close frame with a status code and reason.
    pub fn close(code: CloseCode, reason: impl AsRef<[u8]>) -> Self {
        let reason = reason.as_ref();
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.extend_from_slice(&u16::from(code).to_be_bytes());
        payload.extend_from_slice(reason);

        Self::new(true, OpCode::Close, None, payload)
    }

    /// Creates a new WebSocket close frame with a raw payload.
    ///
    /// This method does not validate if `payload` is a valid close frame payload.
    pub fn close_raw(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Close, None, payload.as_ref())
    }

    /// Sets the FIN flag.
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Returns whether the frame carries a masking key.
    #[inline(always)]
    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Returns the masking key, if any.
    pub fn mask_key(&self) -> Option<[u8; 4]> {
        self.mask
    }

    /// Extracts the close code from a Close frame's payload.
    ///
    /// Returns `None` if the payload is too short to contain a code.
    pub fn close_code(&self) -> Option<CloseCode> {
        let code = u16::from_be_bytes(self.payload.get(0..2)?.try_into().ok()?);
        Some(CloseCode::from(code))
    }

    /// Extracts the close reason from a Close frame's payload.
    ///
    /// # Returns
    /// - `Ok(None)` if the payload carries no reason.
    /// - `Ok(Some(&str))` with the reason.
    /// - `Err(WebSocketError::InvalidUTF8)` if the reason is not valid UTF-8.
    pub fn close_reason(&self) -> Result<Option<&str>> {
        match self.payload.get(2..) {
            Some(reason) if !reason.is_empty() => std::str::from_utf8(reason)
                .map(Some)
                .map_err(|_| WebSocketError::InvalidUTF8),
            _ => Ok(None),
        }
    }

    /// Masks the payload in place with the frame's key, generating a random key first if the frame
    /// has none.
    pub(crate) fn mask(&mut self) {
        let key = *self.mask.get_or_insert_with(mask::random_key);
        mask::apply_mask(&mut self.payload, key);
    }

    /// Reverses the masking of the payload and forgets the key.
    pub(crate) fn unmask(&mut self) {
        if let Some(key) = self.mask.take() {
            mask::apply_mask(&mut self.payload, key);
        }
    }

    /// Drops the masking key without touching the payload.
    pub(crate) fn clear_mask(&mut self) {
        self.mask = None;
    }

    /// Formats the frame header into the provided `head` buffer and returns its size.
    ///
    /// # Returns
    /// - The size of the header (2, 4 or 10 bytes, plus 4 if masked).
    ///
    /// # Panics
    /// Panics if `head` is shorter than [`MAX_HEAD_SIZE`].
    pub(crate) fn fmt_head(&self, head: &mut [u8]) -> usize {
        head[0] = (self.fin as u8) << 7 | u8::from(self.opcode);

        let len = self.payload.len();
        let size = if len <= 125 {
            head[1] = len as u8;
            2
        } else if len <= u16::MAX as usize {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        if let Some(mask) = self.mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&mask);
            size + 4
        } else {
            size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod opcode_tests {
        use super::*;

        #[test]
        fn test_is_control() {
            assert!(OpCode::Close.is_control());
            assert!(OpCode::Ping.is_control());
            assert!(OpCode::Pong.is_control());

            assert!(!OpCode::Continuation.is_control());
            assert!(!OpCode::Text.is_control());
            assert!(!OpCode::Binary.is_control());
        }

        #[test]
        fn test_try_from_u8() {
            for op in [
                OpCode::Continuation,
                OpCode::Text,
                OpCode::Binary,
                OpCode::Close,
                OpCode::Ping,
                OpCode::Pong,
            ] {
                assert_eq!(OpCode::try_from(u8::from(op)).unwrap(), op);
            }

            for code in [0x3, 0x4, 0x5, 0x6, 0x7, 0xB, 0xC, 0xD, 0xE, 0xF] {
                assert!(matches!(
                    OpCode::try_from(code),
                    Err(WebSocketError::InvalidOpCode(c)) if c == code
                ));
            }
        }
    }

    mod frame_tests {
        use super::*;

        #[test]
        fn test_close_frame_payload() {
            let frame = Frame::close(CloseCode::Normal, "Normal closure");

            assert!(frame.fin);
            assert_eq!(frame.opcode, OpCode::Close);
            assert_eq!(&frame.payload[..2], &1000u16.to_be_bytes());
            assert_eq!(frame.close_code(), Some(CloseCode::Normal));
            assert_eq!(frame.close_reason().unwrap(), Some("Normal closure"));
        }

        #[test]
        fn test_close_frame_without_code() {
            let frame = Frame::close_raw(b"");
            assert_eq!(frame.close_code(), None);
            assert_eq!(frame.close_reason().unwrap(), None);

            let frame = Frame::close_raw([0x03, 0xE8, 0xFF, 0xFE]);
            assert_eq!(frame.close_code(), Some(CloseCode::Normal));
            assert!(matches!(
                frame.close_reason(),
                Err(WebSocketError::InvalidUTF8)
            ));
        }

        #[test]
        fn test_frame_mask_unmask() {
            let payload = BytesMut::from("Mask me");
            let mut frame = Frame::new(
                true,
                OpCode::Binary,
                Some([0x01, 0x02, 0x03, 0x04]),
                payload.clone(),
            );

            frame.mask();
            assert_ne!(frame.payload, payload);

            frame.unmask();
            assert_eq!(frame.payload, payload);
            assert!(!frame.is_masked());
        }

        #[test]
        fn test_mask_generates_key() {
            let mut frame = Frame::text("hello");
            assert!(!frame.is_masked());

            frame.mask();
            assert!(frame.is_masked());
        }

        #[test]
        fn test_fmt_head_small_masked() {
            let mask_key = [0xAA, 0xBB, 0xCC, 0xDD];
            let frame = Frame::new(true, OpCode::Text, Some(mask_key), "Header test");

            let mut head = [0u8; MAX_HEAD_SIZE];
            let size = frame.fmt_head(&mut head);

            assert_eq!(size, 2 + 4);
            assert_eq!(head[0], 0x81);
            assert_eq!(head[1], 0x80 | 11);
            assert_eq!(&head[2..6], &mask_key);
        }

        #[test]
        fn test_fmt_head_length_boundaries() {
            let cases = [
                (125usize, 2usize, 125u8),
                (126, 4, 126),
                (65535, 4, 126),
                (65536, 10, 127),
            ];

            for (len, expected_size, code) in cases {
                let frame = Frame::binary(vec![0u8; len]).with_fin(false);
                let mut head = [0u8; MAX_HEAD_SIZE];
                let size = frame.fmt_head(&mut head);

                assert_eq!(size, expected_size, "len {len}");
                assert_eq!(head[0], 0x02);
                assert_eq!(head[1], code);

                let encoded_len = match size {
                    2 => head[1] as usize,
                    4 => u16::from_be_bytes([head[2], head[3]]) as usize,
                    _ => u64::from_be_bytes(head[2..10].try_into().unwrap()) as usize,
                };
                assert_eq!(encoded_len, len);
            }
        }
    }
}
