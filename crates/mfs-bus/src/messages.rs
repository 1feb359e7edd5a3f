//! Bus protocol frames
//!
//! Every WebSocket text message between a client and the bus server is one
//! JSON-encoded `BusFrame`. Payloads are opaque strings to the server.

use serde::{Deserialize, Serialize};

/// Frames sent over the bus WebSocket
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusFrame {
    /// First frame from a client
    Hello {
        /// Shared secret, checked when the server has one configured
        #[serde(default)]
        token: String,
        /// Free-form client label for logs
        #[serde(default)]
        client_name: String,
    },

    /// Handshake accepted
    Welcome { client_id: String },

    /// Start receiving publishes on a channel
    Subscribe { channel: String },

    /// Stop receiving publishes on a channel
    Unsubscribe { channel: String },

    /// Publish a payload to every subscriber of a channel
    Publish { channel: String, payload: String },

    /// A payload published on a channel this client subscribes to
    Deliver {
        channel: String,
        /// Client id of the publisher
        from: String,
        payload: String,
    },

    /// Error response
    Error { code: ErrorCode, message: String },

    /// Ping for keepalive
    Ping { timestamp: u64 },

    /// Pong response
    Pong { timestamp: u64 },
}

/// Error codes
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Token did not match
    Unauthorized,

    /// Frame sent before a successful hello
    NotAuthenticated,

    /// Frame could not be parsed or is not valid from a client
    InvalidFrame,

    /// Channel has reached its subscriber limit
    ChannelFull,

    /// Internal server error
    InternalError,
}

impl BusFrame {
    /// Create an error frame
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
