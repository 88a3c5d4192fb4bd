//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while parsing or validating wire data.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// JSON could not be parsed or did not match the expected shape.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An event type tag is syntactically invalid.
    #[error("invalid event type tag: {0:?}")]
    InvalidTag(String),

    /// A known event type carried a payload that could not be decoded.
    #[error("malformed payload for {event_type}: {message}")]
    MalformedPayload {
        /// The event type tag.
        event_type: String,
        /// What was wrong with it.
        message: String,
    },

    /// A stream record was not valid UTF-8.
    #[error("record is not valid UTF-8")]
    InvalidUtf8,

    /// A stream record exceeded the configured size limit.
    #[error("record of {len} bytes exceeds limit of {max} bytes")]
    RecordTooLarge {
        /// Bytes buffered when the limit was hit.
        len: usize,
        /// The configured limit.
        max: usize,
    },

    /// A payload variant did not match the operation kind it was used with.
    #[error("payload mismatch: expected {expected}, got {actual}")]
    PayloadMismatch {
        /// Kind the caller asked for.
        expected: String,
        /// Kind the payload actually carries.
        actual: String,
    },
}

impl ProtocolError {
    /// Creates a malformed payload error.
    pub fn malformed(event_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedPayload {
            event_type: event_type.into(),
            message: message.into(),
        }
    }
}
