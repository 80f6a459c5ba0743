//! Error types for Tunesync core operations.
//!
//! Transports report every failure as a single [`TransportError`] carrying a
//! human-readable message. The crate-wide [`Error`] wraps it alongside the
//! library, registry and configuration failures of the surrounding glue.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a transport operation.
///
/// Connection, authentication, remote I/O and subprocess failures all map to
/// this one kind; callers distinguish causes by message text only.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Error: {message}")]
pub struct TransportError {
    /// What went wrong, as reported by the backend.
    pub message: String,
}

impl TransportError {
    /// Create a transport error from any displayable message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Create a transport error describing a failed operation on a path.
    pub fn at(operation: &str, path: &str, reason: impl std::fmt::Display) -> Self {
        Self::new(format!("{operation} {path}: {reason}"))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Errors that can occur in Tunesync core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A transport operation failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The music library could not be read.
    #[error("Library error at {path}: {reason}")]
    Library {
        /// Path that could not be read.
        path: PathBuf,
        /// Underlying reason.
        reason: String,
    },

    /// The device registry could not be read or written.
    #[error("Registry error at {path}: {reason}")]
    Registry {
        /// Registry file path.
        path: PathBuf,
        /// Underlying reason.
        reason: String,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A device index outside the registry was addressed.
    #[error("Device index {index} out of range (registry holds {len} devices)")]
    InvalidDeviceIndex {
        /// Requested index.
        index: usize,
        /// Number of registered devices.
        len: usize,
    },

    /// The background sync worker panicked before returning.
    #[error("Sync worker panicked")]
    WorkerPanicked,

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Build a library error for a path.
    pub fn library(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Self::Library {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Build a registry error for a path.
    pub fn registry(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Self::Registry {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error came from a transport.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
