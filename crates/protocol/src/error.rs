//! Error types for the protocol crate.

use thiserror::Error;

/// Errors from message coding and credential checks.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A message could not be encoded.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A frame is not valid JSON or does not match any message shape.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// Token is malformed or its signature does not match.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// Token signature is valid but its expiry has passed.
    #[error("token expired at {expired_at}")]
    TokenExpired {
        /// Expiry as a Unix timestamp.
        expired_at: i64,
    },

    /// Stored password hash cannot be parsed.
    #[error("invalid password hash: {0}")]
    InvalidPasswordHash(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}
