//! One framed transport and its I/O tasks.
//!
//! Each connection runs three tasks on the reactor:
//!
//! - **reader**: decodes frames and routes them through the dispatcher,
//!   resolving responses inline and queueing handler work;
//! - **handler**: runs queued handler jobs one at a time, in arrival order;
//! - **writer**: drains the outbound queue in FIFO order, flushing when the
//!   queue runs dry.
//!
//! [`Connection`] is the cheap, cloneable handle to all of that. It reaches
//! its endpoint only through a weak pointer: the registry owns sessions, and
//! a connection whose endpoint is gone simply closes.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use tether_core::{
    CloseReason, ConnectionId, Frame, FrameCodec, MessageType, ProtocolError, RequestError,
};
use tether_settings::ConnectionSettings;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, trace, warn};

use crate::dispatcher::InboundJob;
use crate::endpoint::EndpointInner;
use crate::metrics::{FRAMES_RECEIVED_TOTAL, FRAMES_SENT_TOTAL, PROTOCOL_ERRORS_TOTAL, SEND_QUEUE_FULL_TOTAL};
use crate::registry::SessionState;

const IO_TASKS: u8 = 3;

struct ConnectionInner {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    state: AtomicU8,
    live_tasks: AtomicU8,
    outbound: mpsc::Sender<Frame>,
    token: CancellationToken,
    close_reason: OnceLock<CloseReason>,
    max_frame_size: usize,
    endpoint: Weak<EndpointInner>,
}

/// Handle to one live (or closed) connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    fn new(
        id: ConnectionId,
        peer: Option<SocketAddr>,
        settings: &ConnectionSettings,
        endpoint: Weak<EndpointInner>,
    ) -> (Self, mpsc::Receiver<Frame>) {
        let (outbound, rx) = mpsc::channel(settings.send_queue_capacity.max(1));
        let inner = ConnectionInner {
            id,
            peer,
            state: AtomicU8::new(SessionState::Connecting as u8),
            live_tasks: AtomicU8::new(0),
            outbound,
            token: CancellationToken::new(),
            close_reason: OnceLock::new(),
            max_frame_size: settings.max_frame_size,
            endpoint,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// A connection with no transport or endpoint behind it.
    #[cfg(test)]
    pub(crate) fn detached(id: ConnectionId, settings: &ConnectionSettings) -> Self {
        Self::new(id, None, settings, Weak::new()).0
    }

    /// Process-unique id.
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Remote address, when the transport has one.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Whether `close` has run.
    pub fn is_closed(&self) -> bool {
        !self.state().is_open()
    }

    /// Why the connection closed, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close_reason.get().cloned()
    }

    /// Frames queued and not yet written.
    pub fn queued_frames(&self) -> usize {
        self.inner.outbound.max_capacity() - self.inner.outbound.capacity()
    }

    /// Resolves once `close` has run.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        self.inner.token.clone().cancelled_owned()
    }

    /// Queue a frame for writing. Never blocks.
    ///
    /// Fails with `ConnectionClosed` after `close`, `QueueFull` when the
    /// outbound queue is at capacity (the connection stays up) and `Rejected`
    /// for payloads above the frame limit.
    pub fn send(&self, frame: Frame) -> Result<(), RequestError> {
        if self.is_closed() {
            return Err(RequestError::ConnectionClosed);
        }
        if frame.len() > self.inner.max_frame_size {
            return Err(RequestError::Rejected(ProtocolError::FrameTooLarge {
                length: frame.len(),
                max: self.inner.max_frame_size,
            }));
        }
        match self.inner.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                counter!(SEND_QUEUE_FULL_TOTAL).increment(1);
                warn!(connection_id = %self.inner.id, "send queue full");
                Err(RequestError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(RequestError::ConnectionClosed),
        }
    }

    /// Queue a one-way message.
    pub fn send_message(
        &self,
        message_type: impl Into<MessageType>,
        body: impl Into<Bytes>,
    ) -> Result<(), RequestError> {
        self.send(Frame::new(message_type, body))
    }

    /// Close the connection. Idempotent; returns `true` for the call that
    /// actually closed it.
    ///
    /// Synchronously makes further sends fail, cancels queued writes,
    /// removes the session from its registry and fails every call pending
    /// on this connection with `ConnectionClosed`. The transport is released
    /// once the I/O tasks observe the cancellation.
    pub fn close(&self, reason: CloseReason) -> bool {
        let mut current = self.inner.state.load(Ordering::Acquire);
        loop {
            if !SessionState::from_u8(current).is_open() {
                return false;
            }
            match self.inner.state.compare_exchange(
                current,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let _ = self.inner.close_reason.set(reason.clone());
        self.inner.token.cancel();
        if let Some(endpoint) = self.inner.endpoint.upgrade() {
            endpoint.connection_closed(self.inner.id, &reason);
        }
        if self.inner.live_tasks.load(Ordering::Acquire) == 0 {
            self.inner
                .state
                .store(SessionState::Closed as u8, Ordering::Release);
        }
        true
    }

    pub(crate) fn mark_established(&self) {
        let _ = self.inner.state.compare_exchange(
            SessionState::Connecting as u8,
            SessionState::Established as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    fn task_exited(&self) {
        if self.inner.live_tasks.fetch_sub(1, Ordering::AcqRel) == 1 && self.is_closed() {
            self.inner
                .state
                .store(SessionState::Closed as u8, Ordering::Release);
        }
    }
}

/// Keeps the live-task count and guarantees the connection closes if a task
/// ends without closing it (a panicking handler, for one).
struct TaskGuard {
    connection: Connection,
}

impl TaskGuard {
    fn new(connection: Connection) -> Self {
        let _ = connection.inner.live_tasks.fetch_add(1, Ordering::AcqRel);
        Self { connection }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let _ = self.connection.close(CloseReason::Transport(
            "connection task exited unexpectedly".to_owned(),
        ));
        self.connection.task_exited();
    }
}

/// Build a connection for `transport` without starting its tasks.
pub(crate) fn prepare(
    peer: Option<SocketAddr>,
    settings: &ConnectionSettings,
    endpoint: Weak<EndpointInner>,
) -> (Connection, mpsc::Receiver<Frame>) {
    Connection::new(ConnectionId::next(), peer, settings, endpoint)
}

/// Start the reader, handler and writer tasks for `connection`.
pub(crate) fn spawn_io<T>(
    endpoint: &EndpointInner,
    connection: &Connection,
    transport: T,
    outbound: mpsc::Receiver<Frame>,
) where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let settings = endpoint.settings();
    let (read_half, write_half) = tokio::io::split(transport);
    let frames_in = FramedRead::new(read_half, FrameCodec::new(settings.max_frame_size));
    let frames_out = FramedWrite::new(write_half, FrameCodec::new(settings.max_frame_size));
    let (jobs_tx, jobs_rx) = mpsc::channel(settings.handler_queue_capacity.max(1));
    let handler_timeout = settings.handler_timeout();

    let span = info_span!("connection", connection_id = %connection.id(), role = endpoint.role());

    // Guards are created before spawning so the live count is complete
    // before any task can finish.
    let reader = read_loop(TaskGuard::new(connection.clone()), frames_in, jobs_tx);
    let handler = handler_loop(TaskGuard::new(connection.clone()), jobs_rx, handler_timeout);
    let writer = write_loop(TaskGuard::new(connection.clone()), frames_out, outbound);

    let _ = endpoint.spawn(reader.instrument(span.clone()));
    let _ = endpoint.spawn(handler.instrument(span.clone()));
    let _ = endpoint.spawn(writer.instrument(span));
}

/// Reads frames and routes them. Responses resolve inline. Handler jobs go
/// to the handler queue; when it is full they wait in a backlog of the same
/// size while the reader keeps resolving responses. Reading pauses only once
/// the backlog is full too.
async fn read_loop<R>(
    guard: TaskGuard,
    mut frames: FramedRead<ReadHalf<R>, FrameCodec>,
    jobs: mpsc::Sender<InboundJob>,
) where
    R: AsyncRead + Send,
{
    let connection = &guard.connection;
    let token = connection.token().clone();
    let backlog_limit = jobs.max_capacity();
    let mut backlog: VecDeque<InboundJob> = VecDeque::new();
    loop {
        let next = tokio::select! {
            biased;
            () = token.cancelled() => break,
            permit = jobs.reserve(), if !backlog.is_empty() => {
                let Ok(permit) = permit else { break };
                if let Some(job) = backlog.pop_front() {
                    permit.send(job);
                }
                continue;
            }
            next = frames.next(), if backlog.len() < backlog_limit => next,
        };
        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                if let tether_core::CodecError::Protocol(protocol) = &err {
                    let kind = match protocol {
                        ProtocolError::FrameTooLarge { .. } => "too_large",
                        ProtocolError::FrameCorrupt(_) => "corrupt",
                        ProtocolError::UnknownMessageType(_) => "unknown_type",
                    };
                    counter!(PROTOCOL_ERRORS_TOTAL, "kind" => kind).increment(1);
                }
                warn!(error = %err, "read failed, closing");
                let _ = connection.close(err.into_close_reason());
                break;
            }
            None => {
                debug!("peer closed the stream");
                let _ = connection.close(CloseReason::PeerClosed);
                break;
            }
        };

        counter!(FRAMES_RECEIVED_TOTAL).increment(1);
        trace!(message_type = %frame.message_type, len = frame.len(), "frame received");

        let Some(endpoint) = connection.inner.endpoint.upgrade() else {
            let _ = connection.close(CloseReason::Shutdown);
            break;
        };
        let routed = endpoint.dispatcher().route(frame, connection);
        drop(endpoint);

        match routed {
            Ok(None) => {}
            Ok(Some(job)) if backlog.is_empty() => match jobs.try_send(job) {
                Ok(()) => {}
                Err(TrySendError::Full(job)) => {
                    debug!("handler queue full, holding job");
                    backlog.push_back(job);
                }
                Err(TrySendError::Closed(_)) => break,
            },
            Ok(Some(job)) => backlog.push_back(job),
            Err(reason) => {
                let _ = connection.close(reason);
                break;
            }
        }
    }
}

async fn handler_loop(guard: TaskGuard, mut jobs: mpsc::Receiver<InboundJob>, timeout: Duration) {
    let connection = &guard.connection;
    let token = connection.token().clone();
    loop {
        let job = tokio::select! {
            biased;
            () = token.cancelled() => break,
            job = jobs.recv() => job,
        };
        let Some(job) = job else { break };
        // A job that has started runs to completion (bounded by the handler
        // timeout) even if the connection closes meanwhile.
        job.run(connection, timeout).await;
    }
}

async fn write_loop<W>(
    guard: TaskGuard,
    mut sink: FramedWrite<WriteHalf<W>, FrameCodec>,
    mut outbound: mpsc::Receiver<Frame>,
) where
    W: AsyncWrite + Send,
{
    let connection = &guard.connection;
    let token = connection.token().clone();
    loop {
        let frame = tokio::select! {
            biased;
            () = token.cancelled() => break,
            frame = outbound.recv() => frame,
        };
        let Some(frame) = frame else { break };
        let message_type = frame.message_type;

        let written = async {
            sink.feed(frame).await?;
            if outbound.is_empty() {
                sink.flush().await?;
            }
            Ok::<_, tether_core::CodecError>(())
        };
        let result = tokio::select! {
            biased;
            () = token.cancelled() => break,
            result = written => result,
        };
        match result {
            Ok(()) => {
                counter!(FRAMES_SENT_TOTAL).increment(1);
                trace!(%message_type, "frame written");
            }
            Err(err) => {
                warn!(error = %err, "write failed, closing");
                let _ = connection.close(err.into_close_reason());
                break;
            }
        }
    }
    outbound.close();
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn settings(queue: usize, max_frame: usize) -> ConnectionSettings {
        ConnectionSettings {
            send_queue_capacity: queue,
            max_frame_size: max_frame,
            ..ConnectionSettings::default()
        }
    }

    #[test]
    fn new_connection_is_connecting() {
        let (conn, _rx) = Connection::new(ConnectionId::next(), None, &settings(4, 64), Weak::new());
        assert_eq!(conn.state(), SessionState::Connecting);
        conn.mark_established();
        assert_eq!(conn.state(), SessionState::Established);
        assert!(conn.close_reason().is_none());
    }

    #[tokio::test]
    async fn send_is_fifo() {
        let (conn, mut rx) = Connection::new(ConnectionId::next(), None, &settings(4, 64), Weak::new());
        conn.send_message(1u16, &b"a"[..]).unwrap();
        conn.send_message(2u16, &b"b"[..]).unwrap();
        assert_eq!(conn.queued_frames(), 2);
        assert_eq!(rx.recv().await.unwrap().message_type, MessageType(1));
        assert_eq!(rx.recv().await.unwrap().message_type, MessageType(2));
    }

    #[test]
    fn full_queue_is_backpressure_not_close() {
        let (conn, _rx) = Connection::new(ConnectionId::next(), None, &settings(1, 64), Weak::new());
        conn.send_message(1u16, Bytes::new()).unwrap();
        assert_matches!(conn.send_message(1u16, Bytes::new()), Err(RequestError::QueueFull));
        assert!(!conn.is_closed());
    }

    #[test]
    fn oversize_send_rejected() {
        let (conn, _rx) = Connection::new(ConnectionId::next(), None, &settings(4, 4), Weak::new());
        assert_matches!(
            conn.send_message(1u16, &b"12345"[..]),
            Err(RequestError::Rejected(ProtocolError::FrameTooLarge { length: 5, max: 4 }))
        );
    }

    #[tokio::test]
    async fn close_is_idempotent_and_synchronous() {
        let (conn, _rx) = Connection::new(ConnectionId::next(), None, &settings(4, 64), Weak::new());
        conn.mark_established();
        assert!(conn.close(CloseReason::Local));
        assert!(!conn.close(CloseReason::PeerClosed));
        assert_matches!(conn.send_message(1u16, Bytes::new()), Err(RequestError::ConnectionClosed));
        assert_eq!(conn.close_reason(), Some(CloseReason::Local));
        // no I/O tasks were ever started, so the state settles immediately
        assert_eq!(conn.state(), SessionState::Closed);
        tokio::time::timeout(Duration::from_secs(1), conn.closed())
            .await
            .unwrap();
    }
}
