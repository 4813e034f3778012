//! Error types for the writeback cache.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for writeback operations.
pub type WritebackResult<T> = Result<T, WritebackError>;

/// Error variants for writeback operations.
#[derive(Debug, Error)]
pub enum WritebackError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An endpoint string that does not parse.
    #[error("malformed endpoint {input:?}")]
    MalformedEndpoint {
        /// The string that failed to parse.
        input: String,
    },

    /// A path under the cache root that is not a valid writeback link.
    #[error("not a writeback link: {path:?}")]
    MalformedLink {
        /// The offending path.
        path: PathBuf,
    },

    /// No store client could be bound for an endpoint.
    #[error("cannot bind store for {endpoint}: {reason}")]
    Bind {
        /// The endpoint that failed to bind.
        endpoint: String,
        /// Description of the failure.
        reason: String,
    },

    /// The remote store rejected or failed a put.
    #[error("store put failed: {0}")]
    Put(String),

    /// The store answered a put with a different reference than requested.
    #[error("reference mismatch: expected {expected:?}, server returned {returned:?}")]
    ReferenceMismatch {
        /// The reference the writeback was submitted under.
        expected: String,
        /// The reference the store computed.
        returned: String,
    },

    /// The queue has been closed and accepts no more work.
    #[error("writeback queue has shut down")]
    Shutdown,
}

impl WritebackError {
    /// Whether this error looks like a server timeout.
    ///
    /// Classification is by message inspection because store transports do
    /// not expose a typed timeout kind.
    /// TODO: classify from a typed store error kind instead of message text.
    pub fn is_timeout(&self) -> bool {
        let message = self.to_string();
        message.contains("timeout") || message.contains("400")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        assert!(WritebackError::Put("request timeout".to_string()).is_timeout());
        assert!(WritebackError::Put("server said 400".to_string()).is_timeout());
        assert!(!WritebackError::Put("connection refused".to_string()).is_timeout());
        assert!(!WritebackError::Shutdown.is_timeout());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: WritebackError = io.into();
        assert!(matches!(err, WritebackError::Io(_)));
        assert!(!err.is_timeout());
    }
}
