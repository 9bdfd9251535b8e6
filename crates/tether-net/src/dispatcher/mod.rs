//! Inbound routing and outbound correlation.
//!
//! Inbound, the connection's reader hands every decoded frame to
//! [`Dispatcher::route`]:
//!
//! - responses and error responses resolve the matching [`PendingCall`]
//!   inline, without touching the handler queue;
//! - messages and requests with a registered handler become a job for the
//!   connection's handler task;
//! - everything else falls under the [`UnknownTypePolicy`].
//!
//! Outbound, [`Dispatcher::call`] registers the pending entry first and only
//! then queues the request frame, so a response can never race ahead of its
//! registration.

mod handler;
mod pending;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use tether_core::{
    CloseReason, ConnectionId, Envelope, Frame, MessageType, ProtocolError, RequestError, RequestId,
};
use tether_settings::{ConnectionSettings, UnknownTypePolicy};
use tracing::{debug, warn};

pub use handler::{FnHandler, HandlerError, HandlerTable, MessageHandler, handler_fn};
pub use pending::{CorrelationTable, PendingCall, PendingRequest};

use crate::connection::Connection;
use crate::metrics::{HANDLER_ERRORS_TOTAL, PROTOCOL_ERRORS_TOTAL, UNKNOWN_TYPE_TOTAL};

/// Work for a connection's handler task.
pub(crate) struct InboundJob {
    handler: Arc<dyn MessageHandler>,
    message_type: MessageType,
    request_id: Option<RequestId>,
    body: Bytes,
}

impl InboundJob {
    /// Run the handler and, for requests, queue the reply.
    pub(crate) async fn run(self, connection: &Connection, timeout: Duration) {
        let from = connection.id();
        let outcome = match tokio::time::timeout(timeout, self.handler.handle(self.body, from)).await
        {
            Ok(result) => result,
            Err(_elapsed) => Err(HandlerError::Timeout(timeout)),
        };

        if let Err(err) = &outcome {
            let label = match err {
                HandlerError::Failed(_) => "failed",
                HandlerError::Timeout(_) => "timeout",
            };
            counter!(HANDLER_ERRORS_TOTAL, "outcome" => label).increment(1);
            warn!(
                connection_id = %from,
                message_type = %self.message_type,
                error = %err,
                "handler failed"
            );
        }

        let Some(request_id) = self.request_id else {
            return;
        };
        let reply = match outcome {
            Ok(body) => Envelope::Response { request_id, body },
            Err(err) => Envelope::ErrorResponse {
                request_id,
                message: err.to_string(),
            },
        };
        if let Err(err) = connection.send(reply.into_frame()) {
            debug!(connection_id = %from, %request_id, error = %err, "could not queue reply");
        }
    }
}

/// Routes frames for one endpoint.
#[derive(Debug)]
pub struct Dispatcher {
    handlers: HandlerTable,
    correlation: Arc<CorrelationTable>,
    policy: UnknownTypePolicy,
}

impl Dispatcher {
    /// Create a dispatcher with no handlers.
    pub fn new(settings: &ConnectionSettings) -> Self {
        Self {
            handlers: HandlerTable::new(),
            correlation: Arc::new(CorrelationTable::new()),
            policy: settings.unknown_type_policy,
        }
    }

    /// Handler registration.
    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    /// Outstanding calls.
    pub fn correlation(&self) -> &Arc<CorrelationTable> {
        &self.correlation
    }

    /// Policy for frames without a handler.
    pub fn unknown_type_policy(&self) -> UnknownTypePolicy {
        self.policy
    }

    /// Route one inbound frame received on `connection`.
    ///
    /// Returns a job for the handler task, nothing (the frame was fully
    /// handled here), or the reason the connection must close.
    pub(crate) fn route(
        &self,
        frame: Frame,
        connection: &Connection,
    ) -> Result<Option<InboundJob>, CloseReason> {
        let from = connection.id();
        let envelope = Envelope::from_frame(frame).map_err(|err| {
            counter!(PROTOCOL_ERRORS_TOTAL, "kind" => "corrupt").increment(1);
            CloseReason::Protocol(err)
        })?;

        match envelope {
            Envelope::Response { request_id, body } => {
                let _ = self.correlation.complete(request_id, from, Ok(body));
                Ok(None)
            }
            Envelope::ErrorResponse {
                request_id,
                message,
            } => {
                let _ = self
                    .correlation
                    .complete(request_id, from, Err(RequestError::Remote { message }));
                Ok(None)
            }
            Envelope::Message { message_type, body } => {
                match self.handlers.get(message_type) {
                    Some(handler) => Ok(Some(InboundJob {
                        handler,
                        message_type,
                        request_id: None,
                        body,
                    })),
                    None => self.unroutable(connection, message_type, None),
                }
            }
            Envelope::Request {
                request_id,
                message_type,
                body,
            } => match self.handlers.get(message_type) {
                Some(handler) => Ok(Some(InboundJob {
                    handler,
                    message_type,
                    request_id: Some(request_id),
                    body,
                })),
                None => self.unroutable(connection, message_type, Some(request_id)),
            },
        }
    }

    fn unroutable(
        &self,
        connection: &Connection,
        message_type: MessageType,
        request_id: Option<RequestId>,
    ) -> Result<Option<InboundJob>, CloseReason> {
        let from = connection.id();
        match self.policy {
            UnknownTypePolicy::Drop => {
                counter!(UNKNOWN_TYPE_TOTAL, "policy" => "drop").increment(1);
                warn!(connection_id = %from, %message_type, "no handler for message type, dropping");
                if let Some(request_id) = request_id {
                    let reply = Envelope::ErrorResponse {
                        request_id,
                        message: ProtocolError::UnknownMessageType(message_type.0).to_string(),
                    };
                    let _ = connection.send(reply.into_frame());
                }
                Ok(None)
            }
            UnknownTypePolicy::Close => {
                counter!(UNKNOWN_TYPE_TOTAL, "policy" => "close").increment(1);
                warn!(connection_id = %from, %message_type, "no handler for message type, closing");
                Err(CloseReason::Protocol(ProtocolError::UnknownMessageType(
                    message_type.0,
                )))
            }
        }
    }

    /// Issue a correlated request on `connection`.
    ///
    /// Never blocks. Failures to queue the frame resolve the returned call
    /// immediately.
    pub fn call(
        &self,
        connection: &Connection,
        message_type: impl Into<MessageType>,
        body: Bytes,
        timeout: Duration,
    ) -> PendingCall {
        let message_type = message_type.into();
        if message_type.is_reserved() {
            return PendingCall::failed(RequestError::Rejected(
                ProtocolError::UnknownMessageType(message_type.0),
            ));
        }
        let call = self.correlation.register(connection.id(), timeout);
        let request_id = call.request_id();
        let frame = Envelope::Request {
            request_id,
            message_type,
            body,
        }
        .into_frame();
        if let Err(err) = connection.send(frame) {
            let _ = self.correlation.fail(request_id, err);
        }
        call
    }

    /// Fire-and-forget message on `connection`.
    pub fn send(
        &self,
        connection: &Connection,
        message_type: impl Into<MessageType>,
        body: Bytes,
    ) -> Result<(), RequestError> {
        let message_type = message_type.into();
        if message_type.is_reserved() {
            return Err(RequestError::Rejected(ProtocolError::UnknownMessageType(
                message_type.0,
            )));
        }
        connection.send(Frame {
            message_type,
            payload: body,
        })
    }

    /// Fail every call outstanding on a connection that just closed.
    pub(crate) fn connection_closed(&self, id: ConnectionId) -> usize {
        self.correlation.fail_connection(id)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tether_core::ConnectionId;

    use super::*;

    fn dispatcher(policy: UnknownTypePolicy) -> Dispatcher {
        Dispatcher::new(&ConnectionSettings {
            unknown_type_policy: policy,
            ..ConnectionSettings::default()
        })
    }

    fn connection() -> Connection {
        Connection::detached(ConnectionId::next(), &ConnectionSettings::default())
    }

    #[test]
    fn message_with_handler_becomes_job() {
        let d = dispatcher(UnknownTypePolicy::Drop);
        d.handlers()
            .register(
                7u16,
                handler_fn(|body, _| async move { Ok::<_, HandlerError>(body) }),
            )
            .unwrap();
        let job = d
            .route(Frame::new(7u16, Bytes::from_static(b"x")), &connection())
            .unwrap()
            .unwrap();
        assert_eq!(job.message_type, MessageType(7));
        assert!(job.request_id.is_none());
    }

    #[test]
    fn unknown_type_dropped_under_drop_policy() {
        let d = dispatcher(UnknownTypePolicy::Drop);
        let routed = d.route(Frame::new(9u16, Bytes::new()), &connection()).unwrap();
        assert!(routed.is_none());
    }

    #[test]
    fn unknown_type_closes_under_close_policy() {
        let d = dispatcher(UnknownTypePolicy::Close);
        let err = d
            .route(Frame::new(9u16, Bytes::new()), &connection())
            .err()
            .unwrap();
        assert_eq!(
            err,
            CloseReason::Protocol(ProtocolError::UnknownMessageType(9))
        );
    }

    #[test]
    fn corrupt_envelope_closes() {
        let d = dispatcher(UnknownTypePolicy::Drop);
        let err = d
            .route(
                Frame::new(MessageType::RESPONSE, Bytes::from_static(&[1, 2])),
                &connection(),
            )
            .err()
            .unwrap();
        assert_matches!(err, CloseReason::Protocol(ProtocolError::FrameCorrupt(_)));
    }

    #[tokio::test]
    async fn response_resolves_pending_inline() {
        let d = dispatcher(UnknownTypePolicy::Drop);
        let conn = connection();
        let call = d.correlation().register(conn.id(), Duration::from_secs(5));
        let frame = Envelope::Response {
            request_id: call.request_id(),
            body: Bytes::from_static(b"ok"),
        }
        .into_frame();
        assert!(d.route(frame, &conn).unwrap().is_none());
        assert_eq!(&call.await.unwrap()[..], b"ok");
    }

    #[tokio::test]
    async fn error_response_resolves_remote() {
        let d = dispatcher(UnknownTypePolicy::Drop);
        let conn = connection();
        let call = d.correlation().register(conn.id(), Duration::from_secs(5));
        let frame = Envelope::ErrorResponse {
            request_id: call.request_id(),
            message: "nope".into(),
        }
        .into_frame();
        assert!(d.route(frame, &conn).unwrap().is_none());
        assert_matches!(call.await, Err(RequestError::Remote { message }) if message == "nope");
    }

    #[tokio::test]
    async fn call_on_closed_connection_fails_fast() {
        let d = dispatcher(UnknownTypePolicy::Drop);
        let conn = connection();
        let _ = conn.close(CloseReason::Local);
        let call = d.call(&conn, 1u16, Bytes::new(), Duration::from_secs(5));
        assert_matches!(call.await, Err(RequestError::ConnectionClosed));
        assert!(d.correlation().is_empty());
    }

    #[tokio::test]
    async fn reserved_types_rejected_outbound() {
        let d = dispatcher(UnknownTypePolicy::Drop);
        let conn = connection();
        assert_matches!(
            d.send(&conn, MessageType::RESPONSE, Bytes::new()),
            Err(RequestError::Rejected(_))
        );
        assert_matches!(
            d.call(&conn, 0xFF01u16, Bytes::new(), Duration::from_secs(1)).await,
            Err(RequestError::Rejected(_))
        );
    }
}
