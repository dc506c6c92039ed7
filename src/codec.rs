//! # Codec
//!
//! Streaming encoder and decoder for WebSocket frames, meant to be driven by
//! [`tokio_util::codec::FramedRead`] and [`tokio_util::codec::FramedWrite`].
//!
//! Both halves know the [`Role`] of the local endpoint: a server rejects unmasked frames and never masks
//! what it sends, a client does the opposite. Frames coming out of the [`Decoder`] are already unmasked.
//!
//! ```rust
//! use bytes::BytesMut;
//! use tokio_util::codec::{Decoder as _, Encoder as _};
//! use wsgate::{codec::{Decoder, Encoder}, frame::{Frame, OpCode}, Role};
//!
//! let mut buf = BytesMut::new();
//! Encoder::new(Role::Client).encode(Frame::text("hi"), &mut buf).unwrap();
//!
//! let frame = Decoder::new(Role::Server, 1024).decode(&mut buf).unwrap().unwrap();
//! assert_eq!(frame.opcode, OpCode::Text);
//! assert_eq!(&frame.payload[..], b"hi");
//! ```
use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE},
    Role, WebSocketError,
};

/// Represents the reading state of a WebSocket frame.
enum ReadState {
    /// The first two bytes were consumed, the extended length and mask are pending.
    Header(Header),
    /// The full header was consumed, the payload is pending.
    Payload(HeaderAndMask),
}

/// Fields read from the first two bytes of a frame.
struct Header {
    fin: bool,
    opcode: OpCode,
    masked: bool,
    /// Size of the extended length field: 0, 2 or 8 bytes.
    extra: usize,
    /// 7-bit length from the second byte.
    length_code: u8,
    /// Bytes left before the payload (extended length plus masking key).
    header_size: usize,
}

/// Contains header and mask data after decoding the bytes before the payload.
struct HeaderAndMask {
    header: Header,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// A combined codec that provides both encoding and decoding functionality for WebSocket frames.
///
/// This codec can be used with Tokio's `Framed` to drive both directions over a single transport.
/// [`WebSocket`](crate::WebSocket) splits the transport instead and uses the halves separately.
pub struct Codec {
    decoder: Decoder,
    encoder: Encoder,
}

impl Codec {
    /// Creates a codec for an endpoint acting as `role`.
    pub fn new(role: Role, max_payload_size: usize) -> Self {
        Self {
            decoder: Decoder::new(role, max_payload_size),
            encoder: Encoder::new(role),
        }
    }
}

impl From<(Decoder, Encoder)> for Codec {
    fn from((decoder, encoder): (Decoder, Encoder)) -> Self {
        Self { decoder, encoder }
    }
}

impl codec::Decoder for Codec {
    type Item = <Decoder as codec::Decoder>::Item;
    type Error = <Decoder as codec::Decoder>::Error;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode(src)
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = <Encoder as codec::Encoder<Frame>>::Error;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encoder.encode(item, dst)
    }
}

/// A decoder for WebSocket frames, handling state transitions.
///
/// The decoder is resumable: when `src` does not yet hold a complete frame it keeps what it already
/// parsed and returns `Ok(None)`, picking up where it left off on the next call.
pub struct Decoder {
    /// Current reading state, `None` between frames.
    state: Option<ReadState>,
    role: Role,
    /// Maximum allowed size for a frame payload.
    max_payload_size: usize,
}

impl Decoder {
    /// Creates a new `Decoder` for an endpoint acting as `role`.
    ///
    /// # Parameters
    /// - `role`: The local role. A server requires masked frames, a client rejects them.
    /// - `max_payload_size`: The maximum allowed payload size, in bytes.
    pub fn new(role: Role, max_payload_size: usize) -> Self {
        Self {
            state: None,
            role,
            max_payload_size,
        }
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    /// Decodes WebSocket frames from a `BytesMut` buffer, managing header and payload parsing.
    ///
    /// # Returns
    /// - `Ok(Some(Frame))`: a complete frame with its payload unmasked.
    /// - `Ok(None)`: more data is needed to complete the frame.
    /// - `Err(WebSocketError)`: a protocol violation was detected. The decoder must not be used
    ///   afterwards.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state.take() {
                None => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let fin = src[0] & 0b1000_0000 != 0;

                    // no extension is ever negotiated, so RSV1-3 must be clear
                    if src[0] & 0b0111_0000 != 0 {
                        return Err(WebSocketError::ReservedBitsNotZero);
                    }

                    let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;
                    let masked = src[1] & 0b1000_0000 != 0;
                    let length_code = src[1] & 0x7F;

                    match (self.role, masked) {
                        (Role::Server, false) => return Err(WebSocketError::UnmaskedFrame),
                        (Role::Client, true) => return Err(WebSocketError::MaskedFrame),
                        _ => {}
                    }

                    if opcode.is_control() {
                        if !fin {
                            return Err(WebSocketError::ControlFrameFragmented);
                        }
                        if usize::from(length_code) > MAX_CONTROL_PAYLOAD {
                            return Err(WebSocketError::ControlFrameTooLarge);
                        }
                    }

                    let extra = match length_code {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    src.advance(2);

                    self.state = Some(ReadState::Header(Header {
                        fin,
                        opcode,
                        masked,
                        extra,
                        length_code,
                        header_size: extra + masked as usize * 4,
                    }));
                }
                Some(ReadState::Header(header)) => {
                    if src.remaining() < header.header_size {
                        self.state = Some(ReadState::Header(header));
                        return Ok(None);
                    }

                    let payload_len = match header.extra {
                        0 => usize::from(header.length_code),
                        2 => usize::from(src.get_u16()),
                        _ => {
                            let len = src.get_u64();
                            // the most significant bit of a 64-bit length must be 0
                            if len >> 63 != 0 {
                                return Err(WebSocketError::FrameTooLarge);
                            }
                            usize::try_from(len).map_err(|_| WebSocketError::FrameTooLarge)?
                        }
                    };

                    if payload_len > self.max_payload_size {
                        return Err(WebSocketError::FrameTooLarge);
                    }

                    let mask = if header.masked {
                        Some(src.get_u32().to_be_bytes())
                    } else {
                        None
                    };

                    self.state = Some(ReadState::Payload(HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    }));
                }
                Some(ReadState::Payload(header_and_mask)) => {
                    if src.remaining() < header_and_mask.payload_len {
                        src.reserve(header_and_mask.payload_len - src.remaining());
                        self.state = Some(ReadState::Payload(header_and_mask));
                        return Ok(None);
                    }

                    let HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    } = header_and_mask;

                    let payload = src.split_to(payload_len);
                    let mut frame = Frame::new(header.fin, header.opcode, mask, payload);
                    frame.unmask();

                    break Ok(Some(frame));
                }
            }
        }
    }
}

/// WebSocket frame encoder for serializing `Frame` instances into a buffer.
///
/// A client encoder masks every frame, generating a fresh random key unless the frame already carries
/// one. A server encoder strips any key and writes the payload as is.
pub struct Encoder {
    role: Role,
}

impl Encoder {
    /// Creates a new `Encoder` for an endpoint acting as `role`.
    pub fn new(role: Role) -> Self {
        Self { role }
    }
}

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    fn encode(&mut self, mut frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match self.role {
            Role::Client => frame.mask(),
            Role::Server => frame.clear_mask(),
        }

        let mut header = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut header[..]);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&header[..size]);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}
