//! Custom error types for the director.
//!
//! This module defines the primary error type, `DirectorError`, shared by the
//! server and client halves. Using the `thiserror` crate, it gives every layer
//! a typed fault that is carried up the call chain and only turned into a
//! protocol `ERR` line (server) or a process exit code (client) at the
//! outermost boundary.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: loading or validating a configuration file failed.
//! - **`Transport`**: the client/server connection was refused, reset or timed
//!   out. Always fatal to the current session, never retried.
//! - **`Protocol`**: a malformed or out-of-order command. The server answers
//!   `ERR` and keeps serving the connection.
//! - **`Instrument`**: the instrument daemon is unreachable, did not answer or
//!   rejected a command. The session stays in its last reached state.
//! - **`Transfer`**: the length-prefixed file stream broke. Framing is lost, so
//!   the connection is closed.
//! - **`Filesystem`**: an output directory or log artifact could not be written.
//! - **`Workload`**: the external workload command failed (client side only).
//! - **`TimeSync`**: the clocks of client and server drifted too far apart.
//!
//! By using `#[from]`, `DirectorError` can be created from the layer errors
//! with the `?` operator.

use crate::{
    adapters::AdapterError, config::ConfigError, instrument::InstrumentError,
    protocol::ProtocolError, transfer::TransferError,
};
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the director error type.
pub type AppResult<T> = std::result::Result<T, DirectorError>;

#[derive(Error, Debug)]
pub enum DirectorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Instrument error: {0}")]
    Instrument(#[from] InstrumentError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Filesystem error at {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Workload error: {0}")]
    Workload(String),

    #[error("Server rejected '{command}': {message}")]
    Rejected { command: String, message: String },

    #[error("Clock drift of {drift_ms:.3} ms exceeds the allowed {max_ms} ms")]
    TimeSync { drift_ms: f64, max_ms: u64 },
}

impl DirectorError {
    /// Wrap an I/O error that happened while touching `path`.
    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// True when the fault means the byte stream can no longer be trusted and
    /// the connection must be closed rather than answered with `ERR`.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::ConnectionClosed | Self::Transfer(_)
        )
    }
}

impl From<AdapterError> for DirectorError {
    fn from(err: AdapterError) -> Self {
        Self::Instrument(InstrumentError::Adapter(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DirectorError::Workload("exit status 3".to_string());
        assert_eq!(err.to_string(), "Workload error: exit status 3");
    }

    #[test]
    fn test_transfer_errors_close_connection() {
        let err = DirectorError::Transfer(TransferError::NegativeLength(-4));
        assert!(err.is_connection_fatal());

        let err = DirectorError::Protocol(ProtocolError::UnknownVerb("bogus".into()));
        assert!(!err.is_connection_fatal());
    }

    #[test]
    fn test_filesystem_error_names_path() {
        let err = DirectorError::fs(
            "/nonexistent/out",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("/nonexistent/out"));
    }
}
