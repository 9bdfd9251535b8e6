//! Settings error types.

use std::path::PathBuf;

use thiserror::Error;

/// Why settings could not be produced.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The file exists but reading it failed.
    #[error("cannot read {}", path.display())]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not JSON.
    #[error("{} is not valid JSON", path.display())]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Parser error with line and column.
        #[source]
        source: serde_json::Error,
    },
    /// The merged document does not fit the settings schema, e.g. a string
    /// where a number belongs.
    #[error("settings do not match the schema: {0}")]
    Schema(#[from] serde_json::Error),
    /// A value is out of range once every layer has been applied.
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn invalid_value_display() {
        let err = SettingsError::InvalidValue("connection.maxFrameSize must be > 0".into());
        assert_eq!(
            err.to_string(),
            "invalid settings value: connection.maxFrameSize must be > 0"
        );
    }

    #[test]
    fn file_errors_name_the_path_and_keep_the_cause() {
        let err = SettingsError::Read {
            path: PathBuf::from("/etc/tether.json"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert_eq!(err.to_string(), "cannot read /etc/tether.json");
        assert_eq!(err.source().map(ToString::to_string).as_deref(), Some("denied"));
    }

    #[test]
    fn schema_error_from_conversion() {
        let json_err = serde_json::from_str::<u16>("\"port\"").unwrap_err();
        let err: SettingsError = json_err.into();
        assert!(matches!(err, SettingsError::Schema(_)));
        assert!(err.to_string().starts_with("settings do not match the schema"));
    }
}
