//! Length-prefixed framing.
//!
//! # Wire format
//!
//! ```text
//! +----------------+--------------+---------------------+
//! | length: u32 BE | type: u16 BE | payload (length B)  |
//! +----------------+--------------+---------------------+
//! ```
//!
//! `length` counts payload bytes only. Frames whose declared length exceeds
//! the configured maximum are rejected before any payload is buffered, so a
//! corrupt or hostile peer cannot force unbounded allocation.
//!
//! [`FrameCodec`] implements `tokio_util::codec::{Decoder, Encoder}`. The
//! decoder keeps partial-frame state between calls, so a frame may arrive
//! split over any number of reads. Use one codec per connection.

use std::fmt;
use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::{CloseReason, ProtocolError};

/// Header size in bytes: 4 (length) + 2 (type).
pub const HEADER_LEN: usize = 6;

/// Default maximum payload size (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// First message type reserved for the engine.
pub const RESERVED_TYPE_START: u16 = 0xFF00;

/// A 16-bit message type.
///
/// Types below [`RESERVED_TYPE_START`] belong to applications; the range
/// above it carries the request/response correlation envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageType(pub u16);

impl MessageType {
    /// Correlated request: `request_id | inner_type | body`.
    pub const REQUEST: Self = Self(0xFFFF);
    /// Successful response: `request_id | body`.
    pub const RESPONSE: Self = Self(0xFFFE);
    /// Failed response: `request_id | utf-8 message`.
    pub const ERROR_RESPONSE: Self = Self(0xFFFD);

    /// Whether the engine owns this type.
    pub const fn is_reserved(self) -> bool {
        self.0 >= RESERVED_TYPE_START
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

impl From<u16> for MessageType {
    fn from(raw: u16) -> Self {
        Self(raw)
    }
}

/// One decoded frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Message type from the header.
    pub message_type: MessageType,
    /// Opaque payload; its length is the header's length field.
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame.
    pub fn new(message_type: impl Into<MessageType>, payload: impl Into<Bytes>) -> Self {
        Self {
            message_type: message_type.into(),
            payload: payload.into(),
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

/// Codec failure: an I/O error from the underlying stream, or a protocol
/// violation found while decoding/encoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Underlying read/write failure.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Wire protocol violation.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl CodecError {
    /// Map to the reason a connection is closed with.
    pub fn into_close_reason(self) -> CloseReason {
        match self {
            Self::Io(err) => CloseReason::Transport(err.to_string()),
            Self::Protocol(err) => CloseReason::Protocol(err),
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum DecodeState {
    Header,
    Payload {
        length: usize,
        message_type: MessageType,
    },
}

/// Stateful frame encoder/decoder.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_size: usize,
    state: DecodeState,
    unchecked_encode: bool,
}

impl FrameCodec {
    /// Create a codec enforcing `max_frame_size` on both directions.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            state: DecodeState::Header,
            unchecked_encode: false,
        }
    }

    /// Allow the encoder to emit payloads above the maximum (still capped by
    /// the `u32` length field). The decoder is unaffected.
    #[must_use]
    pub fn with_unchecked_encode(mut self) -> Self {
        self.unchecked_encode = true;
        self
    }

    /// Configured maximum payload size.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Whether the decoder is in the middle of a frame.
    pub fn has_partial_frame(&self) -> bool {
        matches!(self.state, DecodeState::Payload { .. })
    }

    fn check_encode_len(&self, length: usize) -> Result<(), ProtocolError> {
        let limit = if self.unchecked_encode {
            u32::MAX as usize
        } else {
            self.max_frame_size.min(u32::MAX as usize)
        };
        if length > limit {
            return Err(ProtocolError::FrameTooLarge { length, max: limit });
        }
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if let DecodeState::Header = self.state {
            if src.len() < HEADER_LEN {
                src.reserve(HEADER_LEN - src.len());
                return Ok(None);
            }
            let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
            if length > self.max_frame_size {
                return Err(ProtocolError::FrameTooLarge {
                    length,
                    max: self.max_frame_size,
                }
                .into());
            }
            src.advance(4);
            let message_type = MessageType(src.get_u16());
            self.state = DecodeState::Payload {
                length,
                message_type,
            };
            src.reserve(length.saturating_sub(src.len()));
        }

        let DecodeState::Payload {
            length,
            message_type,
        } = self.state
        else {
            return Ok(None);
        };
        if src.len() < length {
            return Ok(None);
        }
        let payload = src.split_to(length).freeze();
        self.state = DecodeState::Header;
        Ok(Some(Frame {
            message_type,
            payload,
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() && !self.has_partial_frame() {
            return Ok(None);
        }
        Err(ProtocolError::FrameCorrupt(format!(
            "stream ended inside a frame ({} bytes buffered)",
            src.len()
        ))
        .into())
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        self.check_encode_len(frame.payload.len())?;
        write_frame(&frame, dst);
        Ok(())
    }
}

#[allow(clippy::cast_possible_truncation)]
fn write_frame(frame: &Frame, dst: &mut BytesMut) {
    dst.reserve(frame.wire_len());
    dst.put_u32(frame.payload.len() as u32);
    dst.put_u16(frame.message_type.0);
    dst.extend_from_slice(&frame.payload);
}

/// Encode one frame into a standalone buffer, enforcing `max_frame_size`.
pub fn encode(
    message_type: impl Into<MessageType>,
    payload: &[u8],
    max_frame_size: usize,
) -> Result<Bytes, ProtocolError> {
    let codec = FrameCodec::new(max_frame_size);
    codec.check_encode_len(payload.len())?;
    let frame = Frame::new(message_type, Bytes::copy_from_slice(payload));
    let mut buf = BytesMut::with_capacity(frame.wire_len());
    write_frame(&frame, &mut buf);
    Ok(buf.freeze())
}
