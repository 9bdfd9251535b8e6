//! Handler trait and the per-endpoint handler table.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tether_core::{ConnectionId, MessageType, RegistryError};
use thiserror::Error;

/// Failure reported by a handler. For requests the message is sent back to
/// the caller as an error response.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// The handler rejected or failed to process the payload.
    #[error("{0}")]
    Failed(String),
    /// The handler ran past the configured timeout.
    #[error("handler timed out after {0:?}")]
    Timeout(Duration),
}

impl HandlerError {
    /// A `Failed` error with the given message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Implemented by everything that can serve a message type.
///
/// For requests the returned bytes become the response body; for one-way
/// messages they are discarded.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one payload received on connection `from`.
    async fn handle(&self, payload: Bytes, from: ConnectionId) -> Result<Bytes, HandlerError>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

/// Wrap `f` as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Bytes, ConnectionId) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Bytes, HandlerError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Bytes, ConnectionId) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Bytes, HandlerError>> + Send,
{
    async fn handle(&self, payload: Bytes, from: ConnectionId) -> Result<Bytes, HandlerError> {
        (self.f)(payload, from).await
    }
}

/// Message type to handler mapping.
///
/// Reads happen once per inbound frame and only clone an `Arc`; writes are
/// rare (startup registration).
#[derive(Default)]
pub struct HandlerTable {
    handlers: RwLock<HashMap<MessageType, Arc<dyn MessageHandler>>>,
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("types", &self.types())
            .finish()
    }
}

impl HandlerTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `message_type`, replacing any previous one.
    ///
    /// Types in the reserved range are refused.
    pub fn register(
        &self,
        message_type: impl Into<MessageType>,
        handler: impl MessageHandler + 'static,
    ) -> Result<(), RegistryError> {
        self.register_arc(message_type, Arc::new(handler))
    }

    /// Register a shared handler.
    pub fn register_arc(
        &self,
        message_type: impl Into<MessageType>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), RegistryError> {
        let message_type = message_type.into();
        if message_type.is_reserved() {
            return Err(RegistryError::ReservedType(message_type.0));
        }
        let _ = self.handlers.write().insert(message_type, handler);
        Ok(())
    }

    /// Remove the handler for `message_type`. Returns whether one existed.
    pub fn unregister(&self, message_type: impl Into<MessageType>) -> bool {
        self.handlers.write().remove(&message_type.into()).is_some()
    }

    /// Handler for `message_type`, if registered.
    pub fn get(&self, message_type: MessageType) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.read().get(&message_type).cloned()
    }

    /// Whether `message_type` has a handler.
    pub fn contains(&self, message_type: impl Into<MessageType>) -> bool {
        self.handlers.read().contains_key(&message_type.into())
    }

    /// Registered types, sorted.
    pub fn types(&self) -> Vec<MessageType> {
        let mut types: Vec<_> = self.handlers.read().keys().copied().collect();
        types.sort_unstable();
        types
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    struct Upper;

    #[async_trait]
    impl MessageHandler for Upper {
        async fn handle(&self, payload: Bytes, _from: ConnectionId) -> Result<Bytes, HandlerError> {
            Ok(Bytes::from(payload.to_ascii_uppercase()))
        }
    }

    #[tokio::test]
    async fn trait_handler_runs() {
        let table = HandlerTable::new();
        table.register(1u16, Upper).unwrap();
        let handler = table.get(MessageType(1)).unwrap();
        let out = handler
            .handle(Bytes::from_static(b"abc"), ConnectionId::from_raw(1))
            .await
            .unwrap();
        assert_eq!(&out[..], b"ABC");
    }

    #[tokio::test]
    async fn closure_handler_sees_sender() {
        let table = HandlerTable::new();
        table
            .register(
                2u16,
                handler_fn(|_payload, from: ConnectionId| async move {
                    Ok::<_, HandlerError>(Bytes::from(from.to_string()))
                }),
            )
            .unwrap();
        let out = table
            .get(MessageType(2))
            .unwrap()
            .handle(Bytes::new(), ConnectionId::from_raw(42))
            .await
            .unwrap();
        assert_eq!(&out[..], b"conn_42");
    }

    #[test]
    fn reserved_types_refused() {
        let table = HandlerTable::new();
        assert_matches!(
            table.register(MessageType::REQUEST, Upper),
            Err(RegistryError::ReservedType(0xFFFF))
        );
        assert_matches!(
            table.register(0xFF00u16, Upper),
            Err(RegistryError::ReservedType(0xFF00))
        );
        assert!(table.types().is_empty());
    }

    #[test]
    fn register_replaces_and_unregister_removes() {
        let table = HandlerTable::new();
        table.register(5u16, Upper).unwrap();
        table.register(5u16, Upper).unwrap();
        table.register(3u16, Upper).unwrap();
        assert_eq!(table.types(), vec![MessageType(3), MessageType(5)]);
        assert!(table.unregister(5u16));
        assert!(!table.unregister(5u16));
        assert!(!table.contains(5u16));
        assert!(table.get(MessageType(5)).is_none());
    }

    #[test]
    fn handler_error_display() {
        assert_eq!(HandlerError::failed("bad input").to_string(), "bad input");
        assert_eq!(
            HandlerError::Timeout(Duration::from_millis(5)).to_string(),
            "handler timed out after 5ms"
        );
    }
}
