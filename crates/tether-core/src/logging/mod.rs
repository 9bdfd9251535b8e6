//! `tracing` subscriber setup.
//!
//! The engine only emits events; binaries decide where they go. Library code
//! logs with these conventions:
//!
//! - `info`: connection and endpoint lifecycle
//! - `debug`: per-frame flow
//! - `warn`: dropped, late or unroutable traffic and backpressure
//! - `error`: registry invariant violations
//!
//! Connection tasks carry a `connection_id` span field.

pub mod test_utils;

pub use test_utils::{CapturedEvent, CapturedLogs, capture_logs};

/// Output format for [`init_subscriber_with_format`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact single-line human output.
    #[default]
    Compact,
    /// Newline-delimited JSON.
    Json,
}

/// Install the global subscriber writing compact output to stderr.
///
/// `RUST_LOG` wins over `level` when set. Later calls are no-ops.
pub fn init_subscriber(level: &str) {
    init_subscriber_with_format(level, LogFormat::Compact);
}

/// Install the global subscriber with an explicit output format.
pub fn init_subscriber_with_format(level: &str, format: LogFormat) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    // try_init fails only when a global subscriber already exists
    let _ = match format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_subscriber("warn");
        init_subscriber("debug");
        init_subscriber_with_format("info", LogFormat::Json);
    }

    #[test]
    fn default_format_is_compact() {
        assert_eq!(LogFormat::default(), LogFormat::Compact);
    }
}
