//! Error types for time-lapse operations

use thiserror::Error;

/// Result type alias using the crate's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for capture, persistence and configuration
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration rejected during the startup validation pass
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filename pattern references an unknown placeholder or is malformed
    #[error("Invalid filename pattern: {0}")]
    InvalidPattern(String),

    /// Retryable failure (device timeout, momentary I/O error)
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Unrecoverable failure; scheduling halts
    #[error("Fatal failure: {0}")]
    Fatal(String),

    /// Would-be filename collision or orphaned metadata
    #[error("Data integrity violation: {0}")]
    DataIntegrity(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Image encoding error
    #[error("Image processing error: {0}")]
    Image(String),

    /// JSON encoding/decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the error terminates the run rather than being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::InvalidPattern(_) | Error::Fatal(_) | Error::DataIntegrity(_)
        )
    }
}

impl From<image::ImageError> for Error {
    fn from(e: image::ImageError) -> Self {
        Error::Image(e.to_string())
    }
}

impl From<crate::camera::DeviceError> for Error {
    fn from(e: crate::camera::DeviceError) -> Self {
        match e {
            crate::camera::DeviceError::Unavailable(_) => Error::Fatal(e.to_string()),
            other => Error::Transient(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::DeviceError;
    use std::time::Duration;

    #[test]
    fn test_device_errors_map_onto_taxonomy() {
        let fatal: Error = DeviceError::Unavailable("unplugged".into()).into();
        assert!(fatal.is_fatal());

        let timeout: Error = DeviceError::Timeout(Duration::from_secs(5)).into();
        assert!(matches!(timeout, Error::Transient(_)));
        assert!(!timeout.is_fatal());
    }

    #[test]
    fn test_io_errors_are_retryable() {
        let err: Error = std::io::Error::other("disk busy").into();
        assert!(!err.is_fatal());
    }
}
