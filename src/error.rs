//! Error handling module for maintkit
//!
//! Provides the structured error taxonomy returned by the engine using thiserror.
//! Every failure a front end can observe from `Coordinator` or `LogStore` is one
//! of these variants; nothing in the engine aborts the host process.

use serde::Serialize;
use std::path::PathBuf;
use strum::Display;
use thiserror::Error;

/// Coarse classification of a `MaintenanceError`.
///
/// Front ends branch on this instead of matching variant payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
pub enum ErrorKind {
    /// The process lacks elevated rights
    PermissionDenied,
    /// A run of the same operation is already in flight, or its log is
    /// being written by one
    AlreadyRunning,
    /// Unknown operation id
    NotFound,
    /// A log directory or file could not be created, written, or deleted
    IoFailure,
}

/// Main error type for the maintenance engine
#[derive(Error, Debug)]
pub enum MaintenanceError {
    /// Elevation check failed; no process was spawned and no log touched
    #[error("Administrator privileges are required to perform this operation")]
    PermissionDenied,

    /// Duplicate start request for a busy operation
    #[error("Operation '{id}' is already running")]
    AlreadyRunning { id: String },

    /// The log file is held open for writing, possibly by another process
    #[error("Log '{log_id}' is in use by a running operation")]
    LogInUse { log_id: String },

    /// Unknown operation id (caller/integration bug)
    #[error("Unknown operation '{id}'")]
    NotFound { id: String },

    /// Log directory/file IO failure
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, MaintenanceError>;

impl MaintenanceError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PermissionDenied => ErrorKind::PermissionDenied,
            Self::AlreadyRunning { .. } | Self::LogInUse { .. } => ErrorKind::AlreadyRunning,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Io { .. } => ErrorKind::IoFailure,
        }
    }

    /// Create an already-running error
    pub fn already_running(id: impl Into<String>) -> Self {
        Self::AlreadyRunning { id: id.into() }
    }

    /// Create a log-in-use error
    pub fn log_in_use(log_id: impl Into<String>) -> Self {
        Self::LogInUse { log_id: log_id.into() }
    }

    /// Create a not-found error
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Wrap an IO error with a short description of what was attempted
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Wrap an IO error that concerns a specific path
    pub fn io_at(action: &str, path: &std::path::Path, source: std::io::Error) -> Self {
        Self::io(format!("Failed to {} {}", action, path.display()), source)
    }
}

/// Per-file failure collected by best-effort bulk deletions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathFailure {
    pub path: PathBuf,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MaintenanceError::already_running("defrag");
        assert_eq!(err.to_string(), "Operation 'defrag' is already running");

        let err = MaintenanceError::log_in_use("defragment");
        assert_eq!(err.to_string(), "Log 'defragment' is in use by a running operation");

        let err = MaintenanceError::not_found("not-a-real-id");
        assert_eq!(err.to_string(), "Unknown operation 'not-a-real-id'");
    }

    #[test]
    fn test_io_error_keeps_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        let err = MaintenanceError::io_at("create", std::path::Path::new("/ro/logs"), io_err);
        assert_eq!(err.kind(), ErrorKind::IoFailure);
        assert!(err.to_string().contains("Failed to create /ro/logs"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            MaintenanceError::PermissionDenied.kind(),
            ErrorKind::PermissionDenied
        );
        assert_eq!(
            MaintenanceError::already_running("x").kind(),
            ErrorKind::AlreadyRunning
        );
        assert_eq!(
            MaintenanceError::log_in_use("x").kind(),
            ErrorKind::AlreadyRunning
        );
        assert_eq!(MaintenanceError::not_found("x").kind(), ErrorKind::NotFound);
    }
}
