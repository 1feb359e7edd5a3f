//! Error types for the mfs protocol

use thiserror::Error;

/// Protocol-level errors
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("path traversal attempt blocked: {0}")]
    PathTraversal(String),

    #[error("path {0} is outside the replicated root")]
    OutsideRoot(String),

    #[error("name is not valid UTF-8: {0}")]
    NonUtf8(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("timeout")]
    Timeout,
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Deserialization(e.to_string())
    }
}
