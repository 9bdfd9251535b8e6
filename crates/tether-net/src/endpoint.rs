//! State shared by the server and the client.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::{counter, gauge};
use tether_core::{CloseReason, ConnectionId, MessageType, RegistryError, RequestError};
use tether_settings::ConnectionSettings;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::connection::{self, Connection};
use crate::dispatcher::{Dispatcher, PendingCall};
use crate::events::{ConnectionEvent, EventBus};
use crate::metrics::{CONNECTIONS_ACTIVE, CONNECTIONS_CLOSED_TOTAL, CONNECTIONS_OPENED_TOTAL};
use crate::reactor::ReactorHandle;
use crate::registry::{Session, SessionRegistry};
use crate::shutdown::ShutdownCoordinator;

/// Outcome of a broadcast.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the frame was queued on.
    pub delivered: Vec<ConnectionId>,
    /// Connections that refused it, with the reason.
    pub failed: Vec<(ConnectionId, RequestError)>,
}

impl BroadcastReport {
    /// Whether every recipient accepted the frame.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub(crate) struct EndpointInner {
    role: &'static str,
    settings: ConnectionSettings,
    registry: SessionRegistry,
    dispatcher: Dispatcher,
    events: EventBus,
    reactor: ReactorHandle,
    shutdown: ShutdownCoordinator,
}

impl EndpointInner {
    pub(crate) fn new(
        role: &'static str,
        reactor: ReactorHandle,
        settings: &ConnectionSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            role,
            settings: settings.clone(),
            registry: SessionRegistry::new(),
            dispatcher: Dispatcher::new(settings),
            events: EventBus::new(),
            reactor,
            shutdown: ShutdownCoordinator::new(role),
        })
    }

    pub(crate) fn role(&self) -> &'static str {
        self.role
    }

    pub(crate) fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub(crate) fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn reactor(&self) -> &ReactorHandle {
        &self.reactor
    }

    pub(crate) fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Spawn a connection task into this endpoint's drainable group.
    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.reactor.spawn_in(self.shutdown.tasks(), future)
    }

    /// Wrap `transport` in a connection, register it and start its tasks.
    pub(crate) fn attach<T>(
        self: &Arc<Self>,
        transport: T,
        peer: Option<SocketAddr>,
    ) -> Result<Connection, RegistryError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (connection, outbound) =
            connection::prepare(peer, &self.settings, Arc::downgrade(self));
        self.registry.register(Session::new(connection.clone()))?;
        connection.mark_established();

        // Announce before the I/O tasks exist so `Closed` can never overtake
        // `Established` on the event bus.
        counter!(CONNECTIONS_OPENED_TOTAL, "role" => self.role).increment(1);
        gauge!(CONNECTIONS_ACTIVE, "role" => self.role).increment(1.0);
        info!(connection_id = %connection.id(), ?peer, role = self.role, "connection established");
        let _ = self.events.emit(ConnectionEvent::Established {
            id: connection.id(),
            peer,
        });

        connection::spawn_io(self, &connection, transport, outbound);
        Ok(connection)
    }

    /// Bookkeeping for a connection that just closed. Runs once per
    /// connection, from `Connection::close`.
    pub(crate) fn connection_closed(&self, id: ConnectionId, reason: &CloseReason) {
        if self.registry.remove(id).is_none() {
            return;
        }
        let failed_calls = self.dispatcher.connection_closed(id);
        counter!(CONNECTIONS_CLOSED_TOTAL, "role" => self.role, "reason" => reason.label())
            .increment(1);
        gauge!(CONNECTIONS_ACTIVE, "role" => self.role).decrement(1.0);
        if reason.is_error() {
            info!(connection_id = %id, %reason, failed_calls, "connection closed with error");
        } else {
            info!(connection_id = %id, %reason, failed_calls, "connection closed");
        }
        let _ = self.events.emit(ConnectionEvent::Closed {
            id,
            reason: reason.clone(),
        });
    }

    /// Close every registered connection. Returns how many were closed.
    pub(crate) fn close_all(&self, reason: &CloseReason) -> usize {
        self.registry
            .snapshot()
            .into_iter()
            .filter(|session| session.connection().close(reason.clone()))
            .count()
    }

    pub(crate) fn call(
        &self,
        id: ConnectionId,
        message_type: MessageType,
        body: Bytes,
        timeout: Duration,
    ) -> PendingCall {
        match self.registry.lookup(id) {
            Ok(session) => self
                .dispatcher
                .call(session.connection(), message_type, body, timeout),
            Err(_) => PendingCall::failed(RequestError::ConnectionClosed),
        }
    }

    pub(crate) fn send(
        &self,
        id: ConnectionId,
        message_type: MessageType,
        body: Bytes,
    ) -> Result<(), RequestError> {
        let session = self
            .registry
            .lookup(id)
            .map_err(|_| RequestError::ConnectionClosed)?;
        self.dispatcher.send(session.connection(), message_type, body)
    }

    /// Queue a message on every live connection (snapshot, then send).
    pub(crate) fn broadcast(&self, message_type: MessageType, body: &Bytes) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for session in self.registry.snapshot() {
            let id = session.id();
            match self
                .dispatcher
                .send(session.connection(), message_type, body.clone())
            {
                Ok(()) => report.delivered.push(id),
                Err(err) => report.failed.push((id, err)),
            }
        }
        debug!(
            %message_type,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "broadcast"
        );
        report
    }
}

impl Drop for EndpointInner {
    fn drop(&mut self) {
        // Connections only hold a weak pointer back here; stop their tasks
        // rather than leave them serving a dead endpoint.
        for session in self.registry.snapshot() {
            let _ = session.connection().close(CloseReason::Shutdown);
        }
        self.shutdown.shutdown();
    }
}
