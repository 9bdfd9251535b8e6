//! Request/response correlation envelope.
//!
//! Correlated traffic rides inside reserved message types:
//!
//! | type                | payload layout                                   |
//! |---------------------|--------------------------------------------------|
//! | `REQUEST` (0xFFFF)  | `request_id: u64 BE \| inner_type: u16 BE \| body` |
//! | `RESPONSE` (0xFFFE) | `request_id: u64 BE \| body`                      |
//! | `ERROR_RESPONSE` (0xFFFD) | `request_id: u64 BE \| utf-8 message`       |
//!
//! Every other type is a plain one-way message whose payload is the body.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::ProtocolError;
use crate::frame::{Frame, MessageType};
use crate::ids::RequestId;

const REQUEST_PREFIX: usize = 8 + 2;
const RESPONSE_PREFIX: usize = 8;

/// A frame interpreted through the correlation layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Envelope {
    /// One-way message.
    Message {
        /// Application message type.
        message_type: MessageType,
        /// Payload.
        body: Bytes,
    },
    /// Correlated request expecting a response.
    Request {
        /// Correlation id chosen by the caller.
        request_id: RequestId,
        /// Application message type the handler is registered under.
        message_type: MessageType,
        /// Payload.
        body: Bytes,
    },
    /// Successful response.
    Response {
        /// Id of the request being answered.
        request_id: RequestId,
        /// Handler output.
        body: Bytes,
    },
    /// Handler failure or unroutable request.
    ErrorResponse {
        /// Id of the request being answered.
        request_id: RequestId,
        /// Failure description.
        message: String,
    },
}

impl Envelope {
    /// Parse a decoded frame.
    pub fn from_frame(frame: Frame) -> Result<Self, ProtocolError> {
        let Frame {
            message_type,
            mut payload,
        } = frame;
        match message_type {
            MessageType::REQUEST => {
                ensure_len(&payload, REQUEST_PREFIX, "request")?;
                let request_id = RequestId::from_raw(payload.get_u64());
                let inner = MessageType(payload.get_u16());
                if inner.is_reserved() {
                    return Err(ProtocolError::FrameCorrupt(format!(
                        "request carries reserved inner type {inner}"
                    )));
                }
                Ok(Self::Request {
                    request_id,
                    message_type: inner,
                    body: payload,
                })
            }
            MessageType::RESPONSE => {
                ensure_len(&payload, RESPONSE_PREFIX, "response")?;
                let request_id = RequestId::from_raw(payload.get_u64());
                Ok(Self::Response {
                    request_id,
                    body: payload,
                })
            }
            MessageType::ERROR_RESPONSE => {
                ensure_len(&payload, RESPONSE_PREFIX, "error response")?;
                let request_id = RequestId::from_raw(payload.get_u64());
                let message = String::from_utf8_lossy(&payload).into_owned();
                Ok(Self::ErrorResponse {
                    request_id,
                    message,
                })
            }
            ty if ty.is_reserved() => Err(ProtocolError::UnknownMessageType(ty.0)),
            _ => Ok(Self::Message {
                message_type,
                body: payload,
            }),
        }
    }

    /// Build the wire frame.
    pub fn into_frame(self) -> Frame {
        match self {
            Self::Message { message_type, body } => Frame {
                message_type,
                payload: body,
            },
            Self::Request {
                request_id,
                message_type,
                body,
            } => {
                let mut buf = BytesMut::with_capacity(REQUEST_PREFIX + body.len());
                buf.put_u64(request_id.get());
                buf.put_u16(message_type.0);
                buf.extend_from_slice(&body);
                Frame::new(MessageType::REQUEST, buf.freeze())
            }
            Self::Response { request_id, body } => {
                let mut buf = BytesMut::with_capacity(RESPONSE_PREFIX + body.len());
                buf.put_u64(request_id.get());
                buf.extend_from_slice(&body);
                Frame::new(MessageType::RESPONSE, buf.freeze())
            }
            Self::ErrorResponse {
                request_id,
                message,
            } => {
                let mut buf = BytesMut::with_capacity(RESPONSE_PREFIX + message.len());
                buf.put_u64(request_id.get());
                buf.extend_from_slice(message.as_bytes());
                Frame::new(MessageType::ERROR_RESPONSE, buf.freeze())
            }
        }
    }

    /// Request id for correlated variants.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::Message { .. } => None,
            Self::Request { request_id, .. }
            | Self::Response { request_id, .. }
            | Self::ErrorResponse { request_id, .. } => Some(*request_id),
        }
    }

    /// Overhead the envelope adds on top of a request body.
    pub const fn request_overhead() -> usize {
        REQUEST_PREFIX
    }
}

fn ensure_len(payload: &Bytes, min: usize, what: &str) -> Result<(), ProtocolError> {
    if payload.len() < min {
        return Err(ProtocolError::FrameCorrupt(format!(
            "{what} envelope is {} bytes, need at least {min}",
            payload.len()
        )));
    }
    Ok(())
}
