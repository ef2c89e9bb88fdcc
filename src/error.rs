//! Error types for the data layer

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors surfaced by the store, caches, indexes and providers
#[derive(Error, Debug)]
pub enum DataError {
    /// Invalid caller input (names, priority, tags, missing fields)
    #[error("invalid {field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },

    /// Filesystem failure on a specific path
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A message or record file that is not valid JSON
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Malformed or oversized frame from the daemon
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The daemon rejected a request or aborted a stream
    #[error("daemon error {code}: {message}")]
    Daemon {
        code: String,
        message: String,
        retryable: bool,
    },

    /// No daemon could be reached
    #[error("daemon unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for data layer operations
pub type DataResult<T> = std::result::Result<T, DataError>;

impl DataError {
    /// Create a validation error
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    /// Wrap an I/O error with the path it happened on
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// True when the error is a file or directory that vanished under us
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }

    /// True for caller mistakes that must never be retried
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}
