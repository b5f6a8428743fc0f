//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all wire-level failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame was not valid JSON or did not match any message shape.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The frame carried a `type` tag this protocol does not define.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// A required field was absent or had an unusable value.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField {
        /// Name of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// Failed to serialize an outbound message.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Malformed(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}
