//! Independent read and write paths of a WebSocket connection.
//!
//! Each half owns one side of the split transport and lives behind its own async mutex inside
//! [`WebSocket`](super::WebSocket), so a blocked receive never holds up a send and the other way around.

use std::future::poll_fn;

use bytes::{Buf, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::{
    codec::{Decoder, Encoder},
    frame::{Frame, OpCode},
    Result, WebSocketError,
};

use super::{HttpStream, MessageType, ReceiveResult};

type FrameReader = FramedRead<tokio::io::ReadHalf<HttpStream>, Decoder>;
type FrameWriter = FramedWrite<tokio::io::WriteHalf<HttpStream>, Encoder>;

// ================ ReadHalf ====================

/// Data frame payload that did not fit in the caller's buffer.
struct Pending {
    payload: BytesMut,
    message_type: MessageType,
    fin: bool,
}

/// The receive path: decodes frames and tracks the fragmentation state of incoming messages.
///
/// `ReadHalf` does not answer control frames. It hands them back to the connection, which owns both
/// halves and decides what to send in response.
pub(super) struct ReadHalf {
    /// `None` once the transport was released.
    stream: Option<FrameReader>,
    /// Type of the data message whose final fragment has not arrived yet.
    fragment: Option<MessageType>,
    /// Unread bytes of the last data frame.
    pending: Option<Pending>,
}

impl ReadHalf {
    pub(super) fn new(stream: FrameReader) -> Self {
        Self {
            stream: Some(stream),
            fragment: None,
            pending: None,
        }
    }

    /// Reads the next frame from the transport.
    ///
    /// Returns `Ok(None)` when the peer closed the transport without a Close frame.
    pub(super) async fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(WebSocketError::ConnectionClosed);
        };
        stream.next().await.transpose()
    }

    /// Applies the fragmentation rules to a data frame and stores its payload for delivery.
    ///
    /// - `Text`/`Binary` opens a message; a second one before the previous message ended is an
    ///   `InvalidFragment`.
    /// - `Continuation` extends the open message; without one it is an `InvalidContinuationFrame`.
    pub(super) fn on_data_frame(&mut self, frame: Frame) -> Result<()> {
        let message_type = match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.fragment.is_some() {
                    return Err(WebSocketError::InvalidFragment);
                }
                let message_type = if frame.opcode == OpCode::Text {
                    MessageType::Text
                } else {
                    MessageType::Binary
                };
                if !frame.fin {
                    self.fragment = Some(message_type);
                }
                message_type
            }
            OpCode::Continuation => {
                let message_type = self
                    .fragment
                    .ok_or(WebSocketError::InvalidContinuationFrame)?;
                if frame.fin {
                    self.fragment = None;
                }
                message_type
            }
            _ => return Err(WebSocketError::InvalidOpCode(frame.opcode.into())),
        };

        self.pending = Some(Pending {
            payload: frame.payload,
            message_type,
            fin: frame.fin,
        });

        Ok(())
    }

    /// Copies as much of the pending payload as fits into `buf`.
    ///
    /// Returns `None` if there is nothing pending. `end_of_message` is only set when the last byte of a
    /// final frame was copied.
    pub(super) fn take_pending(&mut self, buf: &mut [u8]) -> Option<ReceiveResult> {
        let pending = self.pending.as_mut()?;

        let count = buf.len().min(pending.payload.len());
        buf[..count].copy_from_slice(&pending.payload[..count]);
        pending.payload.advance(count);

        let drained = pending.payload.is_empty();
        let result = ReceiveResult::data(count, pending.message_type, pending.fin && drained);
        if drained {
            self.pending = None;
        }

        Some(result)
    }

    /// Takes the whole pending payload with its message type and FIN flag.
    pub(super) fn take_pending_frame(&mut self) -> Option<(BytesMut, MessageType, bool)> {
        self.pending
            .take()
            .map(|pending| (pending.payload, pending.message_type, pending.fin))
    }

    pub(super) fn discard_pending(&mut self) {
        self.pending = None;
    }

    /// Drops the read side of the transport.
    pub(super) fn release(&mut self) {
        self.stream = None;
        self.pending = None;
    }
}

// ================ WriteHalf ====================

/// The send path: encodes frames and tracks the fragmentation state of outgoing messages.
pub(super) struct WriteHalf {
    /// `None` once the transport was released.
    sink: Option<FrameWriter>,
    /// Type of the outgoing message whose final frame has not been sent yet.
    fragment: Option<MessageType>,
    /// Set while an encoded frame sits between the codec and the transport. A send future dropped in
    /// that window leaves it set.
    in_flight: bool,
    /// The write side was shut down.
    shut_down: bool,
}

impl WriteHalf {
    pub(super) fn new(sink: FrameWriter) -> Self {
        Self {
            sink: Some(sink),
            fragment: None,
            in_flight: false,
            shut_down: false,
        }
    }

    /// Returns `true` if a previous send was abandoned halfway through a frame.
    #[inline]
    pub(super) fn is_poisoned(&self) -> bool {
        self.in_flight
    }

    /// Sends one data frame of a message.
    ///
    /// The first frame of a message carries the message type, the following ones are continuations.
    pub(super) async fn send_data(
        &mut self,
        payload: &[u8],
        message_type: MessageType,
        end_of_message: bool,
    ) -> Result<()> {
        let opcode = match self.fragment {
            Some(current) if current != message_type => {
                return Err(WebSocketError::MessageInProgress)
            }
            Some(_) => OpCode::Continuation,
            None => message_type
                .opcode()
                .ok_or(WebSocketError::InvalidMessageType)?,
        };

        self.send_frame(Frame::new(end_of_message, opcode, None, payload))
            .await?;

        self.fragment = if end_of_message {
            None
        } else {
            Some(message_type)
        };

        Ok(())
    }

    /// Encodes and flushes a single frame.
    pub(super) async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        if self.in_flight {
            return Err(WebSocketError::IncompleteFrame);
        }
        if self.shut_down {
            return Err(WebSocketError::ConnectionClosed);
        }
        let Some(sink) = self.sink.as_mut() else {
            return Err(WebSocketError::ConnectionClosed);
        };

        // nothing is encoded until the sink has room, so dropping the future here is harmless
        poll_fn(|cx| sink.poll_ready_unpin(cx)).await?;

        self.in_flight = true;
        sink.start_send_unpin(frame)?;
        sink.flush().await?;
        self.in_flight = false;

        Ok(())
    }

    /// Flushes and shuts down the write side of the transport. Later sends fail with
    /// `ConnectionClosed`.
    pub(super) async fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        match self.sink.as_mut() {
            Some(sink) if !self.in_flight => sink.close().await,
            _ => Ok(()),
        }
    }

    /// Drops the write side of the transport.
    pub(super) fn release(&mut self) {
        self.shut_down = true;
        self.in_flight = false;
        self.sink = None;
    }
}
