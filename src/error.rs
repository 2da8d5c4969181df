//! Error types for metapipe.

use std::sync::Arc;

use thiserror::Error;

/// Main error type for all client operations.
///
/// The type is `Clone` so a single connection-level failure can complete
/// every affected sub-command with the same value.
#[derive(Debug, Clone, Error)]
pub enum MemcacheError {
    /// Dial, read or write failure on the underlying stream.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// Malformed or truncated framing from the peer.
    #[error("broken pipe: {reason}")]
    BrokenPipe { reason: String },

    /// `SERVER_ERROR <msg>` returned for one sub-command.
    #[error("server error: {message}")]
    ServerError { message: String },

    /// `CLIENT_ERROR <msg>` (or a bare `ERROR`) returned for one sub-command.
    #[error("client error: {message}")]
    ClientError { message: String },

    /// The connection was shut down before the response arrived.
    #[error("connection closed")]
    ConnectionClosed,

    /// Key is empty, too long, or contains whitespace/control bytes.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Result accessed after `Pipeline::finish` released its buffers.
    #[error("pipeline already finished")]
    PipelineFinished,

    /// Rejected client configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Configuration file could not be parsed.
    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),
}

impl MemcacheError {
    pub(crate) fn broken_pipe(reason: impl Into<String>) -> Self {
        MemcacheError::BrokenPipe {
            reason: reason.into(),
        }
    }

    /// Returns true if the error means the socket can no longer be trusted.
    ///
    /// Server and client errors are scoped to one record and leave the
    /// connection usable.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            MemcacheError::Io(_) | MemcacheError::BrokenPipe { .. } | MemcacheError::ConnectionClosed
        )
    }
}

impl From<std::io::Error> for MemcacheError {
    fn from(err: std::io::Error) -> Self {
        MemcacheError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for MemcacheError {
    fn from(err: serde_json::Error) -> Self {
        MemcacheError::Json(Arc::new(err))
    }
}

/// Result type alias using MemcacheError.
pub type Result<T> = std::result::Result<T, MemcacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_fatal_classification() {
        let io: MemcacheError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert!(io.is_connection_fatal());
        assert!(MemcacheError::broken_pipe("bad").is_connection_fatal());
        assert!(MemcacheError::ConnectionClosed.is_connection_fatal());

        let server = MemcacheError::ServerError {
            message: "out of memory".to_string(),
        };
        assert!(!server.is_connection_fatal());
        let client = MemcacheError::ClientError {
            message: "bad data chunk".to_string(),
        };
        assert!(!client.is_connection_fatal());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            MemcacheError::broken_pipe("missing CRLF").to_string(),
            "broken pipe: missing CRLF"
        );
        assert_eq!(
            MemcacheError::ServerError {
                message: "object too large for cache".to_string()
            }
            .to_string(),
            "server error: object too large for cache"
        );
        assert_eq!(MemcacheError::ConnectionClosed.to_string(), "connection closed");
    }

    #[test]
    fn test_clone_shares_io_error() {
        let err: MemcacheError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone").into();
        let copy = err.clone();
        match (err, copy) {
            (MemcacheError::Io(a), MemcacheError::Io(b)) => assert!(Arc::ptr_eq(&a, &b)),
            _ => panic!("expected io errors"),
        }
    }
}
