//! # tether-core
//!
//! Foundation types for the tether messaging engine.
//!
//! This crate provides the shared vocabulary that the other tether crates
//! depend on:
//!
//! - **IDs**: [`ConnectionId`] and [`RequestId`], monotonically issued and never reused
//! - **Framing**: [`Frame`] and the [`FrameCodec`] (`tokio_util::codec`) for the
//!   length-prefixed wire format
//! - **Envelope**: [`Envelope`], the request/response correlation layer carried
//!   inside reserved message types
//! - **Errors**: the transport / protocol / request / registry taxonomy via `thiserror`
//! - **Retry**: [`RetryPolicy`] and backoff math for reconnecting clients
//! - **Logging**: `tracing` subscriber setup and a capture layer for tests

#![deny(unsafe_code)]

pub mod envelope;
pub mod errors;
pub mod frame;
pub mod ids;
pub mod logging;
pub mod retry;

pub use envelope::Envelope;
pub use errors::{
    CloseReason, ProtocolError, RegistryError, RequestError, TetherError, TransportError,
};
pub use frame::{
    CodecError, DEFAULT_MAX_FRAME_SIZE, Frame, FrameCodec, HEADER_LEN, MessageType,
    RESERVED_TYPE_START,
};
pub use ids::{ConnectionId, RequestId, RequestIdAllocator};
pub use retry::RetryPolicy;
