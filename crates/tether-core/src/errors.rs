//! Error hierarchy for the tether engine.
//!
//! Errors are split by blast radius:
//!
//! - [`TransportError`]: OS/network failures. Always fatal for the connection.
//! - [`ProtocolError`]: malformed or oversized frames, unknown message types.
//!   Fatal for the connection (unknown types may be downgraded by policy).
//! - [`RequestError`]: delivered to the single caller of `call()` and nowhere else.
//! - [`RegistryError`]: invariant violations in bookkeeping; indicate a bug.
//!
//! [`CloseReason`] records why a connection went away and is published with
//! the `Closed` connection event.

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::ids::{ConnectionId, RequestId};

/// OS / network layer failure.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Outbound connect failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Target address.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Listener bind failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested bind address.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Read or write failure on an established transport.
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Wire protocol violation.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Declared (or requested) payload length exceeds the configured maximum.
    #[error("frame of {length} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Offending payload length.
        length: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Header or correlation envelope could not be parsed.
    #[error("corrupt frame: {0}")]
    FrameCorrupt(String),

    /// No handler is registered for the message type.
    #[error("no handler registered for message type {0:#06x}")]
    UnknownMessageType(u16),
}

/// Failure of a single `call()`.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RequestError {
    /// No response arrived before the deadline.
    #[error("{request_id} timed out after {timeout:?}")]
    Timeout {
        /// The request that expired.
        request_id: RequestId,
        /// The timeout it was issued with.
        timeout: Duration,
    },

    /// The connection closed (or was never live) before a response arrived.
    #[error("connection closed before a response arrived")]
    ConnectionClosed,

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// The connection's send queue is full.
    #[error("send queue full")]
    QueueFull,

    /// The peer's handler reported a failure.
    #[error("remote handler failed: {message}")]
    Remote {
        /// Message sent back by the peer.
        message: String,
    },

    /// The request could not be framed (e.g. payload above the maximum).
    #[error("request rejected: {0}")]
    Rejected(ProtocolError),
}

/// Session registry / handler table invariant violation.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The id is already present; the existing entry is untouched.
    #[error("{0} is already registered")]
    DuplicateId(ConnectionId),

    /// The id is not (or no longer) present.
    #[error("{0} not found")]
    NotFound(ConnectionId),

    /// Handlers cannot be registered for engine-reserved message types.
    #[error("message type {0:#06x} is reserved")]
    ReservedType(u16),
}

/// Why a connection was closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by the local application.
    Local,
    /// The peer closed its side (EOF).
    PeerClosed,
    /// Read/write failure.
    Transport(String),
    /// The peer violated the wire protocol.
    Protocol(ProtocolError),
    /// Server stop or client close.
    Shutdown,
}

impl CloseReason {
    /// Whether the close was caused by a failure rather than a request.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Protocol(_))
    }

    /// Whether the local side asked for the close.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local | Self::Shutdown)
    }

    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::PeerClosed => "peer_closed",
            Self::Transport(_) => "transport",
            Self::Protocol(_) => "protocol",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("closed locally"),
            Self::PeerClosed => f.write_str("closed by peer"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Protocol(err) => write!(f, "protocol error: {err}"),
            Self::Shutdown => f.write_str("shutdown"),
        }
    }
}

impl From<ProtocolError> for CloseReason {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err)
    }
}

impl From<&TransportError> for CloseReason {
    fn from(err: &TransportError) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Top-level error type.
#[derive(Debug, Error)]
pub enum TetherError {
    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Protocol violation.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Request failure.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// Registry invariant violation.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl TetherError {
    /// Whether this error must tear down the connection it occurred on.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Protocol(_))
    }
}
