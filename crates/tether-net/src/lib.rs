//! # tether-net
//!
//! The session and protocol layer of the tether engine.
//!
//! - [`Reactor`]: explicitly constructed worker pool that every endpoint runs on
//! - [`Connection`]: one framed transport with a reader, writer and handler task
//! - [`SessionRegistry`]: live sessions by [`ConnectionId`](tether_core::ConnectionId)
//! - [`Dispatcher`]: inbound routing by message type and request/response correlation
//! - [`Server`] / [`Client`]: the two endpoint flavors
//!
//! Handlers for a connection run one at a time in arrival order; different
//! connections are served in parallel across the reactor's workers.

#![deny(unsafe_code)]

pub mod client;
pub mod connection;
pub mod dispatcher;
mod endpoint;
pub mod events;
pub mod metrics;
pub mod reactor;
pub mod registry;
pub mod server;
pub mod shutdown;

pub use client::{Client, ClientError, ClientState};
pub use connection::Connection;
pub use dispatcher::{
    CorrelationTable, Dispatcher, HandlerError, HandlerTable, MessageHandler, PendingCall,
    handler_fn,
};
pub use endpoint::BroadcastReport;
pub use events::{ConnectionEvent, EventBus};
pub use reactor::{Reactor, ReactorHandle};
pub use registry::{Session, SessionRegistry, SessionState};
pub use server::{Server, ServerError, ServerState};
pub use shutdown::{DrainOutcome, ShutdownCoordinator};
