//! Error types for the sync engine.

use shelfsync_protocol::{EntityRef, HandlerKey, OperationId, ProtocolError};
use shelfsync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur inside the engine.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Journal storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Wire data could not be parsed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A remote call failed.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Event stream transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether reconnecting may help.
        retryable: bool,
    },

    /// An operation payload could not be encoded or decoded.
    #[error("payload error: {0}")]
    Payload(String),

    /// A journal record could not be encoded or decoded.
    #[error("journal codec error: {0}")]
    Codec(String),

    /// No handler is registered for an operation kind.
    #[error("no handler registered for {0}")]
    NoHandler(HandlerKey),

    /// The queue holds no row with this id.
    #[error("operation {0} not found")]
    OperationNotFound(OperationId),

    /// The row is not in a state that allows the request.
    #[error("operation {id} is {status}")]
    InvalidState {
        /// The operation.
        id: OperationId,
        /// Its current status.
        status: String,
    },

    /// The entity is not in the local store.
    #[error("entity {0} not found")]
    EntityNotFound(EntityRef),

    /// Stream endpoint or credentials are missing.
    #[error("not configured: {0}")]
    NotConfigured(String),

    /// A blocking or spawned task failed.
    #[error("task failed: {0}")]
    TaskFailed(String),

    /// The operation was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// Timeout.
    #[error("operation timed out")]
    Timeout,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Remote(e) => e.is_retryable(),
            SyncError::Timeout => true,
            SyncError::Storage(StorageError::Io(_)) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Payload(e.to_string())
    }
}

/// Failure of a single request against the remote service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The request never got a response.
    #[error("network error: {0}")]
    Network(String),

    /// The request timed out.
    #[error("request timed out")]
    Timeout,

    /// The server answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// The request was rejected before it was sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The response body could not be understood.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Creates an error from an HTTP status and response body.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Returns the HTTP status, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns true for network trouble, timeouts, 408, 429 and 5xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Network(_) | RemoteError::Timeout => true,
            RemoteError::Status { status, .. } => {
                matches!(status, 408 | 429) || (500..600).contains(status)
            }
            RemoteError::InvalidRequest(_) | RemoteError::InvalidResponse(_) => false,
        }
    }

    /// Returns true if the credentials were refused.
    pub fn is_auth(&self) -> bool {
        matches!(self.status(), Some(401 | 403))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection reset").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::Remote(RemoteError::from_status(503, "busy")).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::OperationNotFound(OperationId(4)).is_retryable());
    }

    #[test]
    fn remote_status_classes() {
        for status in [408, 429, 500, 502, 599] {
            assert!(RemoteError::from_status(status, "").is_retryable(), "{status}");
        }
        for status in [400, 401, 403, 404, 409, 422] {
            assert!(!RemoteError::from_status(status, "").is_retryable(), "{status}");
        }
        assert!(RemoteError::from_status(401, "").is_auth());
        assert!(RemoteError::from_status(403, "").is_auth());
        assert!(!RemoteError::from_status(404, "").is_auth());
        assert!(RemoteError::Network("dns".into()).is_retryable());
        assert!(!RemoteError::InvalidResponse("html".into()).is_retryable());
    }

    #[test]
    fn error_display() {
        let err = RemoteError::from_status(422, "title must not be empty");
        assert_eq!(err.to_string(), "HTTP 422: title must not be empty");

        let err = SyncError::InvalidState {
            id: OperationId(7),
            status: "pending".into(),
        };
        assert_eq!(err.to_string(), "operation #7 is pending");
    }
}
