//! Message types and payloads exchanged between coordinator and workers.
//!
//! Payloads are JSON; the engine only sees opaque bytes.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tether_core::MessageType;
use thiserror::Error;

/// Worker → coordinator request announcing its core count.
pub const HELLO: MessageType = MessageType(0x0100);
/// Coordinator → worker request carrying one [`IntegrationTask`].
pub const INTEGRATE: MessageType = MessageType(0x0101);

/// Payload could not be encoded or decoded.
#[derive(Debug, Error)]
#[error("malformed {kind} payload: {source}")]
pub struct PayloadError {
    kind: &'static str,
    #[source]
    source: serde_json::Error,
}

/// Handshake request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    /// CPU cores the worker will use. Zero means "unknown".
    pub cores: usize,
}

/// Handshake response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    /// Session id the coordinator assigned to this worker.
    pub session_id: u64,
    /// Cores the coordinator will plan with.
    pub cores: usize,
}

/// One sub-interval to integrate.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationTask {
    /// Coordinator-assigned id, unique per run.
    pub task_id: u64,
    /// Lower bound.
    pub lower: f64,
    /// Upper bound.
    pub upper: f64,
    /// Rectangle width.
    pub step: f64,
}

/// Partial result for one task.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationResult {
    /// Id of the task this answers.
    pub task_id: u64,
    /// Integral over the task's interval.
    pub value: f64,
}

/// Serialize a payload.
pub fn encode<T: Serialize>(kind: &'static str, value: &T) -> Result<Bytes, PayloadError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|source| PayloadError { kind, source })
}

/// Deserialize a payload.
pub fn decode<T: DeserializeOwned>(kind: &'static str, body: &[u8]) -> Result<T, PayloadError> {
    serde_json::from_slice(body).map_err(|source| PayloadError { kind, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_types_are_application_range() {
        assert!(!HELLO.is_reserved());
        assert!(!INTEGRATE.is_reserved());
        assert_ne!(HELLO, INTEGRATE);
    }

    #[test]
    fn task_wire_shape() {
        let task = IntegrationTask {
            task_id: 4,
            lower: 2.0,
            upper: 3.5,
            step: 0.25,
        };
        let body = encode("task", &task).unwrap();
        assert_eq!(
            &body[..],
            br#"{"taskId":4,"lower":2.0,"upper":3.5,"step":0.25}"#
        );
        assert_eq!(decode::<IntegrationTask>("task", &body).unwrap(), task);
    }

    #[test]
    fn decode_error_names_payload() {
        let err = decode::<Hello>("hello", b"{").unwrap_err();
        assert!(err.to_string().starts_with("malformed hello payload"));
    }
}
