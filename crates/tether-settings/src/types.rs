//! Settings schema.
//!
//! Every struct is `#[serde(default)]` so a settings file only needs the keys
//! it changes. Keys are camelCase on disk.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_core::frame::DEFAULT_MAX_FRAME_SIZE;
use tether_core::retry::RetryPolicy;

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// Worker pool.
    pub reactor: ReactorSettings,
    /// Per-connection behavior shared by server and client.
    pub connection: ConnectionSettings,
    /// Listener.
    pub server: ServerSettings,
    /// Outbound connection.
    pub client: ClientSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl TetherSettings {
    /// Reject combinations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.reactor.worker_threads == 0 {
            return Err(invalid("reactor.workerThreads must be at least 1"));
        }
        if self.connection.max_frame_size == 0 {
            return Err(invalid("connection.maxFrameSize must be greater than 0"));
        }
        if u32::try_from(self.connection.max_frame_size).is_err() {
            return Err(invalid("connection.maxFrameSize must fit in 32 bits"));
        }
        if self.connection.send_queue_capacity == 0 {
            return Err(invalid("connection.sendQueueCapacity must be at least 1"));
        }
        if self.connection.handler_queue_capacity == 0 {
            return Err(invalid("connection.handlerQueueCapacity must be at least 1"));
        }
        if self.server.max_connections == 0 {
            return Err(invalid("server.maxConnections must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.client.retry.jitter_factor) {
            return Err(invalid("client.retry.jitterFactor must be within 0.0..=1.0"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> SettingsError {
    SettingsError::InvalidValue(msg.to_owned())
}

/// Reactor (worker pool) settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReactorSettings {
    /// Number of worker threads.
    pub worker_threads: usize,
    /// Thread name prefix.
    pub thread_name: String,
}

impl Default for ReactorSettings {
    fn default() -> Self {
        let cores = std::thread::available_parallelism().map_or(2, std::num::NonZeroUsize::get);
        Self {
            worker_threads: cores.max(2),
            thread_name: "tether-worker".to_owned(),
        }
    }
}

/// What to do with a frame whose type has no handler.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownTypePolicy {
    /// Log and discard; an unroutable request gets an error response.
    #[default]
    Drop,
    /// Close the connection with `UnknownMessageType`.
    Close,
}

/// Per-connection settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// Largest accepted payload in bytes.
    pub max_frame_size: usize,
    /// Outbound frames buffered before `send` reports `QueueFull`.
    pub send_queue_capacity: usize,
    /// Inbound frames buffered ahead of the handler task.
    pub handler_queue_capacity: usize,
    /// Unknown message type handling.
    pub unknown_type_policy: UnknownTypePolicy,
    /// Upper bound on a single handler invocation, in ms.
    pub handler_timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            send_queue_capacity: 1024,
            handler_queue_capacity: 256,
            unknown_type_policy: UnknownTypePolicy::Drop,
            handler_timeout_ms: 30_000,
        }
    }
}

impl ConnectionSettings {
    /// Handler timeout as a [`Duration`].
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }
}

/// Listener settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind host.
    pub host: String,
    /// Bind port; 0 picks a free port.
    pub port: u16,
    /// Concurrent connections before new ones are refused.
    pub max_connections: usize,
    /// How long `stop()` waits for in-flight work, in ms.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 9400,
            max_connections: 1024,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl ServerSettings {
    /// `host:port`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Shutdown drain bound as a [`Duration`].
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Outbound connection settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Timeout applied by `call_default`, in ms.
    pub default_call_timeout_ms: u64,
    /// Connect and reconnect policy.
    pub retry: RetryPolicy,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 9400,
            default_call_timeout_ms: 10_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl ClientSettings {
    /// `host:port`.
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Default call timeout as a [`Duration`].
    pub fn default_call_timeout(&self) -> Duration {
        Duration::from_millis(self.default_call_timeout_ms)
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            json: false,
        }
    }
}
