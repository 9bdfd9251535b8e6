//! Request/response correlation.
//!
//! Every `call()` registers a [`PendingRequest`] in the [`CorrelationTable`]
//! before its request frame is queued, and gets back a [`PendingCall`]
//! future. The entry leaves the table exactly once, through whichever of
//! these happens first:
//!
//! - a matching response arrives on the same connection,
//! - the call's deadline fires,
//! - the caller cancels or drops the `PendingCall`,
//! - the connection closes.
//!
//! Removal happens under the table lock, so only one path can win. The
//! winner delivers the result through the request's oneshot after the lock
//! is released. Responses for ids that are no longer in the table are
//! reported and discarded.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use tether_core::{ConnectionId, RequestError, RequestId, RequestIdAllocator};
use tokio::sync::oneshot;
use tokio::time::Sleep;
use tracing::{debug, warn};

use crate::metrics::{CALL_DURATION_SECONDS, CALL_TIMEOUTS_TOTAL, CALLS_TOTAL, LATE_RESPONSES_TOTAL};

type CallResult = Result<Bytes, RequestError>;

/// An outstanding call awaiting its response.
#[derive(Debug)]
pub struct PendingRequest {
    request_id: RequestId,
    connection_id: ConnectionId,
    issued_at: Instant,
    slot: oneshot::Sender<CallResult>,
}

impl PendingRequest {
    /// The request's id.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// The connection the request was sent on.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// When the call was issued.
    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    /// Deliver the result. Consumes the request, so it can happen only once.
    fn resolve(self, result: CallResult) {
        if result.is_ok() {
            histogram!(CALL_DURATION_SECONDS).record(self.issued_at.elapsed().as_secs_f64());
        }
        // The caller may have gone away; nothing to deliver to then.
        let _ = self.slot.send(result);
    }
}

/// Table of outstanding calls for one endpoint.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    ids: RequestIdAllocator,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
}

impl CorrelationTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new outstanding call on `connection_id`.
    pub fn register(self: &Arc<Self>, connection_id: ConnectionId, timeout: Duration) -> PendingCall {
        let request_id = self.ids.next_id();
        let (slot, rx) = oneshot::channel();
        let request = PendingRequest {
            request_id,
            connection_id,
            issued_at: Instant::now(),
            slot,
        };
        let _ = self.pending.lock().insert(request_id, request);
        counter!(CALLS_TOTAL).increment(1);
        PendingCall::new(request_id, timeout, rx, Arc::downgrade(self))
    }

    /// Resolve `request_id` with a result received on `from`.
    ///
    /// Returns `false` (and reports it) when the id is unknown, already
    /// resolved, or belongs to a different connection; the result is dropped.
    pub fn complete(&self, request_id: RequestId, from: ConnectionId, result: CallResult) -> bool {
        let request = {
            let mut pending = self.pending.lock();
            match pending.get(&request_id) {
                Some(request) if request.connection_id == from => pending.remove(&request_id),
                Some(request) => {
                    warn!(
                        %request_id,
                        expected = %request.connection_id,
                        received_on = %from,
                        "response arrived on the wrong connection, ignoring"
                    );
                    None
                }
                None => None,
            }
        };
        if let Some(request) = request {
            debug!(%request_id, connection_id = %from, "call resolved");
            request.resolve(result);
            return true;
        }
        counter!(LATE_RESPONSES_TOTAL).increment(1);
        warn!(%request_id, connection_id = %from, "response for unknown or already resolved request");
        false
    }

    /// Resolve `request_id` with an error, e.g. when its frame could not be
    /// queued. Returns whether the entry was still pending.
    pub fn fail(&self, request_id: RequestId, error: RequestError) -> bool {
        let Some(request) = self.take(request_id) else {
            return false;
        };
        request.resolve(Err(error));
        true
    }

    /// Resolve every call on `connection_id` with `ConnectionClosed`.
    /// Returns how many were pending.
    pub fn fail_connection(&self, connection_id: ConnectionId) -> usize {
        let failed: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            let ids: Vec<RequestId> = pending
                .values()
                .filter(|request| request.connection_id == connection_id)
                .map(|request| request.request_id)
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        let count = failed.len();
        for request in failed {
            request.resolve(Err(RequestError::ConnectionClosed));
        }
        if count > 0 {
            debug!(%connection_id, count, "failed pending calls on closed connection");
        }
        count
    }

    /// Resolve every outstanding call with `ConnectionClosed`.
    pub fn fail_all(&self) -> usize {
        let failed: Vec<PendingRequest> = self.pending.lock().drain().map(|(_, r)| r).collect();
        let count = failed.len();
        for request in failed {
            request.resolve(Err(RequestError::ConnectionClosed));
        }
        count
    }

    /// Number of outstanding calls.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether no calls are outstanding.
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Whether `request_id` is outstanding.
    pub fn contains(&self, request_id: RequestId) -> bool {
        self.pending.lock().contains_key(&request_id)
    }

    /// Outstanding calls on `connection_id`.
    pub fn pending_on(&self, connection_id: ConnectionId) -> usize {
        self.pending
            .lock()
            .values()
            .filter(|request| request.connection_id == connection_id)
            .count()
    }

    fn take(&self, request_id: RequestId) -> Option<PendingRequest> {
        self.pending.lock().remove(&request_id)
    }
}

pin_project! {
    /// Future resolving to a call's response body.
    ///
    /// Resolves exactly once with the response, `Timeout`, `ConnectionClosed`,
    /// `Remote` (peer handler failure) or the error that prevented sending.
    /// Dropping it, or calling [`cancel`](Self::cancel), withdraws the call;
    /// a response arriving later is reported as late.
    #[must_use = "a call is withdrawn when its PendingCall is dropped"]
    pub struct PendingCall {
        request_id: RequestId,
        timeout: Duration,
        deadline: tokio::time::Instant,
        // Armed on first poll, so calls can be issued off the runtime.
        #[pin]
        timer: Option<Sleep>,
        rx: oneshot::Receiver<CallResult>,
        table: Weak<CorrelationTable>,
        finished: bool,
    }

    impl PinnedDrop for PendingCall {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if !*this.finished {
                if let Some(table) = this.table.upgrade() {
                    let _ = table.take(*this.request_id);
                }
            }
        }
    }
}

impl PendingCall {
    fn new(
        request_id: RequestId,
        timeout: Duration,
        rx: oneshot::Receiver<CallResult>,
        table: Weak<CorrelationTable>,
    ) -> Self {
        Self {
            request_id,
            timeout,
            deadline: tokio::time::Instant::now() + timeout,
            timer: None,
            rx,
            table,
            finished: false,
        }
    }

    /// A call that failed before it was issued (no connection, bad type).
    pub fn failed(error: RequestError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self::new(RequestId::from_raw(0), Duration::ZERO, rx, Weak::new())
    }

    /// The correlation id; `req_0` for calls that were never issued.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// The timeout the call was issued with.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Withdraw the call. Returns `true` if it was still outstanding.
    pub fn cancel(mut self) -> bool {
        self.finished = true;
        let Some(table) = self.table.upgrade() else {
            return false;
        };
        match table.take(self.request_id) {
            Some(request) => {
                debug!(request_id = %self.request_id, "call cancelled");
                request.resolve(Err(RequestError::Cancelled));
                true
            }
            None => false,
        }
    }
}

impl Future for PendingCall {
    type Output = CallResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<CallResult> {
        let mut this = self.project();
        if *this.finished {
            return Poll::Ready(Err(RequestError::Cancelled));
        }

        if let Poll::Ready(result) = Pin::new(&mut *this.rx).poll(cx) {
            *this.finished = true;
            // A dropped sender means the table went away with the endpoint.
            return Poll::Ready(result.unwrap_or(Err(RequestError::ConnectionClosed)));
        }

        if this.timer.is_none() {
            this.timer.set(Some(tokio::time::sleep_until(*this.deadline)));
        }
        let elapsed = this
            .timer
            .as_mut()
            .as_pin_mut()
            .is_some_and(|timer| timer.poll(cx).is_ready());
        if elapsed {
            let expired = this.table.upgrade().and_then(|table| table.take(*this.request_id));
            if let Some(request) = expired {
                *this.finished = true;
                counter!(CALL_TIMEOUTS_TOTAL).increment(1);
                warn!(
                    request_id = %this.request_id,
                    connection_id = %request.connection_id,
                    timeout = ?this.timeout,
                    "call timed out"
                );
                return Poll::Ready(Err(RequestError::Timeout {
                    request_id: *this.request_id,
                    timeout: *this.timeout,
                }));
            }
            // Another path already took the entry; its result is on the way
            // through `rx`, which is registered for wakeup above.
        }
        Poll::Pending
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("request_id", &self.request_id)
            .field("timeout", &self.timeout)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
