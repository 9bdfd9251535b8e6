//! Listening endpoint.
//!
//! ```text
//! Idle ──start──► Listening ──stop──► Stopping ──► Stopped
//!   └──────────────────stop───────────────────────────┘
//! ```
//!
//! `stop()` stops accepting, closes every session with
//! [`CloseReason::Shutdown`] (which fails their pending calls with
//! `ConnectionClosed`), then waits up to the shutdown timeout for handler
//! work already running on those connections.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use parking_lot::Mutex;
use tether_core::{CloseReason, ConnectionId, MessageType, RegistryError, RequestError, TransportError};
use tether_settings::{ServerSettings, TetherSettings};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::connection::Connection;
use crate::dispatcher::{HandlerTable, PendingCall};
use crate::endpoint::{BroadcastReport, EndpointInner};
use crate::events::ConnectionEvent;
use crate::metrics::CONNECTIONS_REJECTED_TOTAL;
use crate::reactor::ReactorHandle;
use crate::registry::{Session, SessionRegistry};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Server lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    /// Constructed, not listening.
    Idle,
    /// Accepting connections.
    Listening,
    /// `stop()` in progress.
    Stopping,
    /// Terminal.
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        })
    }
}

/// Server operation failure.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The operation is not valid in the current state.
    #[error("server is {0}")]
    InvalidState(ServerState),
    /// Bind failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

struct AcceptLoop {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// A listening endpoint.
///
/// Share it behind an `Arc` when handlers or other tasks need to send
/// through it.
pub struct Server {
    endpoint: Arc<EndpointInner>,
    settings: ServerSettings,
    state: Mutex<ServerState>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept: Mutex<Option<AcceptLoop>>,
    stopped: CancellationToken,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .field("sessions", &self.endpoint.registry().len())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Create an idle server running on `reactor`.
    pub fn new(reactor: ReactorHandle, settings: &TetherSettings) -> Self {
        Self {
            endpoint: EndpointInner::new("server", reactor, &settings.connection),
            settings: settings.server.clone(),
            state: Mutex::new(ServerState::Idle),
            local_addr: Mutex::new(None),
            accept: Mutex::new(None),
            stopped: CancellationToken::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    /// Bound address once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Handler registration.
    pub fn handlers(&self) -> &HandlerTable {
        self.endpoint.dispatcher().handlers()
    }

    /// Live sessions.
    pub fn sessions(&self) -> &SessionRegistry {
        self.endpoint.registry()
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.endpoint.events().subscribe()
    }

    /// Bind `address` and start accepting. Returns the bound address
    /// (useful with port 0).
    pub async fn start(&self, address: &str) -> Result<SocketAddr, ServerError> {
        {
            let state = self.state.lock();
            if *state != ServerState::Idle {
                return Err(ServerError::InvalidState(*state));
            }
        }

        let listener = self.bind(address).await?;
        let local = listener
            .local_addr()
            .map_err(|source| TransportError::Bind {
                addr: address.to_owned(),
                source,
            })?;

        let mut state = self.state.lock();
        if *state != ServerState::Idle {
            return Err(ServerError::InvalidState(*state));
        }
        let token = self.endpoint.shutdown().token().child_token();
        let task = self.endpoint.reactor().spawn(
            accept_loop(
                listener,
                Arc::clone(&self.endpoint),
                token.clone(),
                self.settings.max_connections,
            )
            .instrument(info_span!("accept", %local)),
        );
        *self.accept.lock() = Some(AcceptLoop { token, task });
        *self.local_addr.lock() = Some(local);
        *state = ServerState::Listening;
        info!(%local, "server listening");
        Ok(local)
    }

    /// Start on the configured `host:port`.
    pub async fn start_configured(&self) -> Result<SocketAddr, ServerError> {
        let address = self.settings.bind_address();
        self.start(&address).await
    }

    async fn bind(&self, address: &str) -> Result<TcpListener, TransportError> {
        let addr = address.to_owned();
        // Bind on the reactor so the listener registers with its I/O driver.
        let bound = self
            .endpoint
            .reactor()
            .spawn(async move { TcpListener::bind(addr).await })
            .await;
        match bound {
            Ok(Ok(listener)) => Ok(listener),
            Ok(Err(source)) => Err(TransportError::Bind {
                addr: address.to_owned(),
                source,
            }),
            Err(join) => Err(TransportError::Bind {
                addr: address.to_owned(),
                source: std::io::Error::other(join),
            }),
        }
    }

    /// Adopt an already-connected transport (an in-memory pipe, a Unix
    /// socket, a TLS stream) as a new session.
    pub fn accept_transport<T>(
        &self,
        transport: T,
        peer: Option<SocketAddr>,
    ) -> Result<Connection, RegistryError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.endpoint.attach(transport, peer)
    }

    /// Look up a live session.
    pub fn session(&self, id: ConnectionId) -> Result<Session, RegistryError> {
        self.endpoint.registry().lookup(id)
    }

    /// Correlated request to connection `id`. A stale id resolves
    /// `ConnectionClosed`.
    pub fn call(
        &self,
        id: ConnectionId,
        message_type: impl Into<MessageType>,
        body: impl Into<Bytes>,
        timeout: Duration,
    ) -> PendingCall {
        self.endpoint
            .call(id, message_type.into(), body.into(), timeout)
    }

    /// One-way message to connection `id`.
    pub fn send(
        &self,
        id: ConnectionId,
        message_type: impl Into<MessageType>,
        body: impl Into<Bytes>,
    ) -> Result<(), RequestError> {
        self.endpoint.send(id, message_type.into(), body.into())
    }

    /// One-way message to every live connection.
    pub fn broadcast(
        &self,
        message_type: impl Into<MessageType>,
        body: impl Into<Bytes>,
    ) -> BroadcastReport {
        self.endpoint.broadcast(message_type.into(), &body.into())
    }

    /// Close one connection.
    pub fn disconnect(&self, id: ConnectionId) -> Result<(), RegistryError> {
        let session = self.endpoint.registry().lookup(id)?;
        let _ = session.connection().close(CloseReason::Local);
        Ok(())
    }

    /// Stop accepting, close all sessions and drain handler work.
    ///
    /// Idempotent. A caller arriving while another stop is in progress
    /// waits for it to reach `Stopped`, then returns `true`. Returns `false`
    /// if this call's drain timed out.
    pub async fn stop(&self) -> bool {
        let in_progress = {
            let mut state = self.state.lock();
            match *state {
                ServerState::Stopped => return true,
                ServerState::Stopping => true,
                ServerState::Idle | ServerState::Listening => {
                    *state = ServerState::Stopping;
                    false
                }
            }
        };
        if in_progress {
            self.stopped.cancelled().await;
            return true;
        }
        info!("server stopping");

        let accept = self.accept.lock().take();
        if let Some(accept) = accept {
            accept.token.cancel();
            if let Err(err) = accept.task.await {
                warn!(error = %err, "accept loop ended abnormally");
            }
        }

        let closed = self.endpoint.close_all(&CloseReason::Shutdown);
        let orphaned = self.endpoint.dispatcher().correlation().fail_all();
        if orphaned > 0 {
            warn!(orphaned, "calls left without a connection at shutdown");
        }
        let drained = self
            .endpoint
            .shutdown()
            .graceful_shutdown(self.settings.shutdown_timeout())
            .await
            .is_drained();

        *self.state.lock() = ServerState::Stopped;
        self.stopped.cancel();
        info!(closed, drained, "server stopped");
        drained
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(accept) = self.accept.get_mut().take() {
            accept.token.cancel();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    endpoint: Arc<EndpointInner>,
    token: CancellationToken,
    max_connections: usize,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            () = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                if endpoint.registry().len() >= max_connections {
                    counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
                    warn!(%peer, max_connections, "connection limit reached, refusing");
                    drop(stream);
                    continue;
                }
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(%peer, error = %err, "could not set TCP_NODELAY");
                }
                if let Err(err) = endpoint.attach(stream, Some(peer)) {
                    error!(%peer, error = %err, "failed to register accepted connection");
                }
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                }
            }
        }
    }
    debug!("accept loop stopped");
}
