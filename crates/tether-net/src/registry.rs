//! Live sessions by connection id.
//!
//! The registry is the only long-lived owner of connections; every other
//! component keeps a [`ConnectionId`] and looks the session up when it needs
//! it. A lookup for a closed (removed) id fails with `NotFound` instead of
//! touching a newer connection, since ids are never reused.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tether_core::{ConnectionId, RegistryError};
use tracing::error;

use crate::connection::Connection;

/// Lifecycle of a session. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SessionState {
    /// Transport exists, I/O tasks not yet running.
    Connecting = 0,
    /// Registered and serving traffic.
    Established = 1,
    /// `close` ran; I/O tasks are winding down.
    Closing = 2,
    /// All I/O tasks have exited and the transport is released.
    Closed = 3,
}

impl SessionState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Connecting,
            1 => Self::Established,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }

    /// Whether `send` is still accepted.
    pub fn is_open(self) -> bool {
        self < Self::Closing
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Established => "established",
            Self::Closing => "closing",
            Self::Closed => "closed",
        })
    }
}

/// A registered connection plus bookkeeping.
#[derive(Clone, Debug)]
pub struct Session {
    connection: Connection,
    registered_at: Instant,
}

impl Session {
    /// Wrap a connection.
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            registered_at: Instant::now(),
        }
    }

    /// Session id (the connection's id).
    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    /// Remote address, if any.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.connection.peer()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.connection.state()
    }

    /// The owned connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Time since registration.
    pub fn age(&self) -> Duration {
        self.registered_at.elapsed()
    }
}

/// Sharded map of live sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<ConnectionId, Session>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session under its id.
    ///
    /// Fails with `DuplicateId` if the id is present; the existing entry is
    /// left untouched.
    pub fn register(&self, session: Session) -> Result<(), RegistryError> {
        let id = session.id();
        match self.sessions.entry(id) {
            Entry::Occupied(_) => {
                error!(connection_id = %id, "duplicate session registration");
                Err(RegistryError::DuplicateId(id))
            }
            Entry::Vacant(slot) => {
                let _ = slot.insert(session);
                Ok(())
            }
        }
    }

    /// Look up a live session.
    pub fn lookup(&self, id: ConnectionId) -> Result<Session, RegistryError> {
        self.sessions
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(RegistryError::NotFound(id))
    }

    /// Remove a session. Removing an absent id is a no-op.
    pub fn remove(&self, id: ConnectionId) -> Option<Session> {
        self.sessions.remove(&id).map(|(_, session)| session)
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Point-in-time copy of all sessions, for acting on without holding
    /// any shard lock.
    pub fn snapshot(&self) -> Vec<Session> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.sessions.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Number of sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
