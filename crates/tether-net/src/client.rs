//! Outbound endpoint with retrying connect and background reconnection.
//!
//! ```text
//! Disconnected ──connect──► Connecting ──ok──► Connected
//!      ▲                        │                  │ peer/transport close
//!      │◄──────attempts spent───┘                  ▼
//!      │◄──────attempts spent────────────────  Reconnecting
//!
//! any state ──close──► Closed (terminal)
//! ```
//!
//! Calls pending on a connection that drops resolve `ConnectionClosed`
//! immediately; they are never replayed on the replacement connection.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use parking_lot::Mutex;
use tether_core::{
    CloseReason, ConnectionId, MessageType, RegistryError, RequestError, RetryPolicy,
    TransportError,
};
use tether_settings::{ClientSettings, TetherSettings};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::connection::Connection;
use crate::dispatcher::{HandlerTable, PendingCall};
use crate::endpoint::EndpointInner;
use crate::events::ConnectionEvent;
use crate::metrics::CONNECT_ATTEMPTS_TOTAL;
use crate::reactor::ReactorHandle;

/// Client lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    /// No connection and none being made.
    Disconnected,
    /// `connect()` in progress.
    Connecting,
    /// A live connection is installed.
    Connected,
    /// The connection dropped; the supervisor is dialing again.
    Reconnecting,
    /// `close()` was called. Terminal.
    Closed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        })
    }
}

/// Client operation failure.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Every connect attempt failed.
    #[error("could not connect to {addr} after {attempts} attempt(s)")]
    ConnectFailed {
        /// Target address.
        addr: String,
        /// Attempts made.
        attempts: u32,
        /// Error from the last attempt.
        #[source]
        source: TransportError,
    },
    /// The client was closed.
    #[error("client is closed")]
    Closed,
    /// `disconnect()` abandoned the attempt.
    #[error("connect abandoned by disconnect")]
    Abandoned,
    /// The operation is not valid in the current state.
    #[error("client is {0}")]
    InvalidState(ClientState),
    /// The new connection could not be registered.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

struct ClientShared {
    endpoint: Arc<EndpointInner>,
    settings: ClientSettings,
    drain_timeout: Duration,
    state: watch::Sender<ClientState>,
    current: Mutex<Option<ConnectionId>>,
    closed: CancellationToken,
    // One token per `connect()`; `disconnect()` cancels it.
    attempt: Mutex<CancellationToken>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ClientShared {
    fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Move to `next` unless already closed. Returns whether it moved.
    fn transition(&self, next: ClientState) -> bool {
        let mut previous = next;
        let moved = self.state.send_if_modified(|state| {
            if *state == ClientState::Closed || *state == next {
                return false;
            }
            previous = *state;
            *state = next;
            true
        });
        if moved {
            debug!(from = %previous, to = %next, "client state changed");
        }
        moved
    }

    fn current_id(&self) -> Option<ConnectionId> {
        *self.current.lock()
    }

    /// The live connection, looked up through the registry.
    fn current(&self) -> Option<Connection> {
        let id = self.current_id()?;
        self.endpoint
            .registry()
            .lookup(id)
            .ok()
            .map(|session| session.connection().clone())
    }

    fn clear_current(&self, id: ConnectionId) {
        let mut current = self.current.lock();
        if *current == Some(id) {
            *current = None;
        }
    }

    fn close_current(&self, reason: CloseReason) {
        let current = self.current.lock().take();
        if let Some(id) = current {
            if let Ok(session) = self.endpoint.registry().lookup(id) {
                let _ = session.connection().close(reason);
            }
        }
    }

    fn interrupted(&self, stop: &CancellationToken) -> Option<ClientError> {
        if self.closed.is_cancelled() {
            Some(ClientError::Closed)
        } else if stop.is_cancelled() {
            Some(ClientError::Abandoned)
        } else {
            None
        }
    }

    /// Make the connection live for callers. Fails if `close()` or
    /// `disconnect()` got there first, in which case the connection is
    /// shut down.
    fn install(&self, connection: &Connection, stop: &CancellationToken) -> Result<(), ClientError> {
        let mut current = self.current.lock();
        let refused = self.interrupted(stop).or_else(|| {
            (!self.transition(ClientState::Connected)).then_some(ClientError::Closed)
        });
        if let Some(err) = refused {
            drop(current);
            let _ = connection.close(CloseReason::Local);
            return Err(err);
        }
        *current = Some(connection.id());
        Ok(())
    }

    async fn dial(&self, address: &str) -> Result<TcpStream, TransportError> {
        let target = address.to_owned();
        // Dial on the reactor so the socket registers with its I/O driver.
        let dialed = self
            .endpoint
            .reactor()
            .spawn(async move { TcpStream::connect(target).await })
            .await;
        match dialed {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(TransportError::Connect {
                addr: address.to_owned(),
                source,
            }),
            Err(join) => Err(TransportError::Connect {
                addr: address.to_owned(),
                source: std::io::Error::other(join),
            }),
        }
    }

    /// Dial with the policy's attempt budget and backoff, then attach.
    async fn establish(
        &self,
        address: &str,
        policy: &RetryPolicy,
        stop: &CancellationToken,
    ) -> Result<Connection, ClientError> {
        let attempts = policy.attempts();
        let mut attempt = 0;
        loop {
            let dialed = tokio::select! {
                biased;
                () = self.closed.cancelled() => return Err(ClientError::Closed),
                () = stop.cancelled() => return Err(ClientError::Abandoned),
                dialed = self.dial(address) => dialed,
            };
            attempt += 1;
            match dialed {
                Ok(stream) => {
                    counter!(CONNECT_ATTEMPTS_TOTAL, "outcome" => "success").increment(1);
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(error = %err, "could not set TCP_NODELAY");
                    }
                    let peer = stream.peer_addr().ok();
                    let connection = self.endpoint.attach(stream, peer)?;
                    if let Some(err) = self.interrupted(stop) {
                        let _ = connection.close(CloseReason::Local);
                        return Err(err);
                    }
                    info!(connection_id = %connection.id(), address, attempt, "connected");
                    return Ok(connection);
                }
                Err(source) => {
                    counter!(CONNECT_ATTEMPTS_TOTAL, "outcome" => "failure").increment(1);
                    if attempt >= attempts {
                        warn!(address, attempts, error = %source, "giving up on connect");
                        return Err(ClientError::ConnectFailed {
                            addr: address.to_owned(),
                            attempts,
                            source,
                        });
                    }
                    let delay = policy.delay_for(attempt - 1);
                    warn!(
                        address,
                        attempt,
                        attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %source,
                        "connect attempt failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        () = self.closed.cancelled() => return Err(ClientError::Closed),
                        () = stop.cancelled() => return Err(ClientError::Abandoned),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Watch the live connection and replace it when the peer drops it.
    async fn supervise(
        self: Arc<Self>,
        mut connection: Connection,
        address: String,
        policy: RetryPolicy,
        stop: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                () = self.closed.cancelled() => return,
                () = stop.cancelled() => return,
                () = connection.closed() => {}
            }
            let reason = connection.close_reason().unwrap_or(CloseReason::PeerClosed);
            self.clear_current(connection.id());

            if reason.is_local() || !policy.reconnect || self.interrupted(&stop).is_some() {
                info!(%reason, "client disconnected");
                let _ = self.transition(ClientState::Disconnected);
                return;
            }

            warn!(%reason, "connection lost, reconnecting");
            let _ = self.transition(ClientState::Reconnecting);
            match self.establish(&address, &policy, &stop).await {
                Ok(next) => {
                    if self.install(&next, &stop).is_err() {
                        return;
                    }
                    connection = next;
                }
                Err(ClientError::Closed | ClientError::Abandoned) => return,
                Err(err) => {
                    error!(error = %err, "reconnect failed");
                    let _ = self.transition(ClientState::Disconnected);
                    return;
                }
            }
        }
    }
}

/// An outbound endpoint.
///
/// Handlers registered on the client serve requests the server sends down
/// the connection.
pub struct Client {
    shared: Arc<ClientShared>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("connection_id", &self.connection_id())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a disconnected client running on `reactor`.
    pub fn new(reactor: ReactorHandle, settings: &TetherSettings) -> Self {
        let (state, _) = watch::channel(ClientState::Disconnected);
        Self {
            shared: Arc::new(ClientShared {
                endpoint: EndpointInner::new("client", reactor, &settings.connection),
                settings: settings.client.clone(),
                drain_timeout: settings.server.shutdown_timeout(),
                state,
                current: Mutex::new(None),
                closed: CancellationToken::new(),
                attempt: Mutex::new(CancellationToken::new()),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> ClientState {
        self.shared.state()
    }

    /// Observe state changes.
    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.shared.state.subscribe()
    }

    /// Handler registration.
    pub fn handlers(&self) -> &HandlerTable {
        self.shared.endpoint.dispatcher().handlers()
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.endpoint.events().subscribe()
    }

    /// Id of the live connection, if any.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.shared.current_id()
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<Connection> {
        self.shared.current()
    }

    /// Connect to the configured `host:port` with the configured policy.
    pub async fn connect_configured(&self) -> Result<ConnectionId, ClientError> {
        let address = self.shared.settings.server_address();
        let policy = self.shared.settings.retry.clone();
        self.connect(&address, &policy).await
    }

    /// Connect to `address`, retrying per `policy`.
    ///
    /// Only valid while disconnected. On failure the client is left
    /// `Disconnected`; on success a supervisor takes over reconnection if
    /// the policy allows it.
    pub async fn connect(&self, address: &str, policy: &RetryPolicy) -> Result<ConnectionId, ClientError> {
        let started = self.shared.state.send_if_modified(|state| {
            if *state == ClientState::Disconnected {
                *state = ClientState::Connecting;
                return true;
            }
            false
        });
        if !started {
            return match self.state() {
                ClientState::Closed => Err(ClientError::Closed),
                other => Err(ClientError::InvalidState(other)),
            };
        }

        let stop = CancellationToken::new();
        *self.shared.attempt.lock() = stop.clone();

        let span = info_span!("client", address);
        let established = self
            .shared
            .establish(address, policy, &stop)
            .instrument(span.clone())
            .await
            .and_then(|connection| {
                self.shared.install(&connection, &stop)?;
                Ok(connection)
            });
        let connection = match established {
            Ok(connection) => connection,
            Err(err) => {
                let _ = self.shared.transition(ClientState::Disconnected);
                return Err(err);
            }
        };

        let supervisor = self.shared.endpoint.reactor().spawn(
            Arc::clone(&self.shared)
                .supervise(connection.clone(), address.to_owned(), policy.clone(), stop)
                .instrument(span),
        );
        // The previous supervisor's token was cancelled by `disconnect()`.
        let _ = self.shared.supervisor.lock().replace(supervisor);
        Ok(connection.id())
    }

    /// Drop the current connection without closing the client. A later
    /// `connect()` may reuse it.
    ///
    /// An attempt or reconnection in flight is abandoned; a connection it
    /// has already attached is closed rather than installed.
    pub fn disconnect(&self) {
        self.shared.attempt.lock().cancel();
        let _ = self.shared.supervisor.lock().take();
        let current = {
            let mut current = self.shared.current.lock();
            let _ = self.shared.transition(ClientState::Disconnected);
            current.take()
        };
        if let Some(session) = current.and_then(|id| self.shared.endpoint.registry().lookup(id).ok()) {
            let _ = session.connection().close(CloseReason::Local);
        }
    }

    /// Correlated request on the current connection. Resolves
    /// `ConnectionClosed` when there is none.
    pub fn call(
        &self,
        message_type: impl Into<MessageType>,
        body: impl Into<Bytes>,
        timeout: Duration,
    ) -> PendingCall {
        match self.shared.current() {
            Some(connection) => self.shared.endpoint.dispatcher().call(
                &connection,
                message_type,
                body.into(),
                timeout,
            ),
            None => PendingCall::failed(RequestError::ConnectionClosed),
        }
    }

    /// [`call`](Self::call) with the configured default timeout.
    pub fn call_default(
        &self,
        message_type: impl Into<MessageType>,
        body: impl Into<Bytes>,
    ) -> PendingCall {
        self.call(message_type, body, self.shared.settings.default_call_timeout())
    }

    /// One-way message on the current connection.
    pub fn send(
        &self,
        message_type: impl Into<MessageType>,
        body: impl Into<Bytes>,
    ) -> Result<(), RequestError> {
        let connection = self.shared.current().ok_or(RequestError::ConnectionClosed)?;
        self.shared
            .endpoint
            .dispatcher()
            .send(&connection, message_type, body.into())
    }

    /// Close the client for good: stop reconnecting, close the connection,
    /// fail outstanding calls and wait for handler work to drain.
    ///
    /// Idempotent. Returns `false` if the drain timed out.
    pub async fn close(&self) -> bool {
        let moved = self.shared.state.send_if_modified(|state| {
            if *state == ClientState::Closed {
                return false;
            }
            *state = ClientState::Closed;
            true
        });
        if !moved {
            return true;
        }
        info!("client closing");
        self.shared.closed.cancel();

        let supervisor = self.shared.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            if let Err(err) = supervisor.await {
                if !err.is_cancelled() {
                    warn!(error = %err, "client supervisor ended abnormally");
                }
            }
        }

        self.shared.close_current(CloseReason::Shutdown);
        let _ = self.shared.endpoint.close_all(&CloseReason::Shutdown);
        let _ = self.shared.endpoint.dispatcher().correlation().fail_all();
        let drained = self
            .shared
            .endpoint
            .shutdown()
            .graceful_shutdown(self.shared.drain_timeout)
            .await
            .is_drained();
        info!(drained, "client closed");
        drained
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shared.closed.cancel();
        self.shared.close_current(CloseReason::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn client() -> Client {
        Client::new(ReactorHandle::current(), &TetherSettings::default())
    }

    #[tokio::test]
    async fn starts_disconnected() {
        let client = client();
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(client.connection_id().is_none());
    }

    #[tokio::test]
    async fn call_without_connection_fails_fast() {
        let client = client();
        assert_matches!(
            client.call(1u16, Bytes::new(), Duration::from_secs(5)).await,
            Err(RequestError::ConnectionClosed)
        );
        assert_matches!(client.send(1u16, Bytes::new()), Err(RequestError::ConnectionClosed));
    }

    #[tokio::test]
    async fn attached_connection_is_closed_when_the_attempt_was_abandoned() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let client = client();
        let stop = CancellationToken::new();

        let connection = client
            .shared
            .establish(&addr, &RetryPolicy::no_retry(), &stop)
            .await
            .unwrap();
        assert_eq!(client.shared.endpoint.registry().len(), 1);
        stop.cancel();

        assert_matches!(
            client.shared.install(&connection, &stop),
            Err(ClientError::Abandoned)
        );
        assert!(!connection.state().is_open());
        assert!(client.shared.endpoint.registry().is_empty());
        assert!(client.connection_id().is_none());
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn abandoned_attempt_never_dials() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let client = client();
        let stop = CancellationToken::new();
        stop.cancel();
        assert_matches!(
            client.shared.establish(&addr, &RetryPolicy::no_retry(), &stop).await,
            Err(ClientError::Abandoned)
        );
        assert!(client.shared.endpoint.registry().is_empty());
    }

    #[tokio::test]
    async fn close_is_terminal() {
        let client = client();
        let mut states = client.watch_state();
        assert!(client.close().await);
        assert!(client.close().await);
        assert_eq!(client.state(), ClientState::Closed);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), ClientState::Closed);
        assert_matches!(
            client.connect("127.0.0.1:1", &RetryPolicy::no_retry()).await,
            Err(ClientError::Closed)
        );
    }

    #[tokio::test]
    async fn transition_never_leaves_closed() {
        let client = client();
        let _ = client.close().await;
        assert!(!client.shared.transition(ClientState::Connected));
        assert_eq!(client.state(), ClientState::Closed);
    }

    #[tokio::test]
    async fn disconnect_without_connection_is_noop() {
        let client = client();
        client.disconnect();
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[test]
    fn connect_failed_display() {
        let err = ClientError::ConnectFailed {
            addr: "127.0.0.1:9".into(),
            attempts: 3,
            source: TransportError::Connect {
                addr: "127.0.0.1:9".into(),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            },
        };
        assert_eq!(err.to_string(), "could not connect to 127.0.0.1:9 after 3 attempt(s)");
    }
}
