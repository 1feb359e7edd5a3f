//! Wire protocol definitions
//!
//! All bus payloads are defined here. Payloads are serialized as JSON text;
//! file content travels base64-encoded inside the JSON body.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::MAX_MESSAGE_SIZE;

/// Bus channels, one subscription per channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Create,
    Write,
    Remove,
    Move,
    Chmod,
    Sync,
}

impl Channel {
    /// Channels carrying file mutations (everything except `Sync`)
    pub const FILE_CHANNELS: [Channel; 5] = [
        Channel::Create,
        Channel::Write,
        Channel::Remove,
        Channel::Move,
        Channel::Chmod,
    ];

    /// Subject name used on the bus
    pub const fn as_str(&self) -> &'static str {
        match self {
            Channel::Create => "CREATE",
            Channel::Write => "WRITE",
            Channel::Remove => "REMOVE",
            Channel::Move => "MOVE",
            Channel::Chmod => "CHMOD",
            Channel::Sync => "SYNC",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Channel::Create),
            "WRITE" => Ok(Channel::Write),
            "REMOVE" => Ok(Channel::Remove),
            "MOVE" => Ok(Channel::Move),
            "CHMOD" => Ok(Channel::Chmod),
            "SYNC" => Ok(Channel::Sync),
            other => Err(ProtocolError::UnknownChannel(other.to_string())),
        }
    }
}

/// The mutation carried by a `WireMessage`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileOp {
    /// Make a directory
    CreateDir { mode: u32, uid: u32, gid: u32 },

    /// Replace a regular file with the full content
    WriteFile {
        mode: u32,
        uid: u32,
        gid: u32,
        #[serde(with = "base64_bytes")]
        content: Vec<u8>,
    },

    /// Create a symlink at the message path pointing at `target`
    Symlink { target: String },

    /// Unlink the path
    Remove,

    /// Rename `from` (wire path) to the message path
    Move { from: String },

    /// Set permission bits
    Chmod { mode: u32 },
}

impl FileOp {
    /// Channel this operation is published on.
    ///
    /// Symlinks share the `Write` channel with file content.
    pub const fn channel(&self) -> Channel {
        match self {
            FileOp::CreateDir { .. } => Channel::Create,
            FileOp::WriteFile { .. } | FileOp::Symlink { .. } => Channel::Write,
            FileOp::Remove => Channel::Remove,
            FileOp::Move { .. } => Channel::Move,
            FileOp::Chmod { .. } => Channel::Chmod,
        }
    }

    /// Short name for logs
    pub const fn name(&self) -> &'static str {
        match self {
            FileOp::CreateDir { .. } => "create_dir",
            FileOp::WriteFile { .. } => "write_file",
            FileOp::Symlink { .. } => "symlink",
            FileOp::Remove => "remove",
            FileOp::Move { .. } => "move",
            FileOp::Chmod { .. } => "chmod",
        }
    }
}

/// A file mutation as published on the bus
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Identity of the publishing host
    pub origin_host: String,
    /// When set and non-empty, only this host applies the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_host: Option<String>,
    /// Path relative to the replicated root, `/`-separated
    pub path: String,
    pub op: FileOp,
}

impl WireMessage {
    pub fn new(origin_host: impl Into<String>, path: impl Into<String>, op: FileOp) -> Self {
        Self {
            origin_host: origin_host.into(),
            target_host: None,
            path: path.into(),
            op,
        }
    }

    /// Address the message to a single host (`None` or `""` = broadcast)
    pub fn with_target(mut self, target: Option<&str>) -> Self {
        self.target_host = target.filter(|t| !t.is_empty()).map(str::to_string);
        self
    }

    pub fn channel(&self) -> Channel {
        self.op.channel()
    }

    /// True if `host` published this message
    pub fn is_from(&self, host: &str) -> bool {
        self.origin_host == host
    }

    /// True if the message is broadcast or targeted at `host`
    pub fn is_addressed_to(&self, host: &str) -> bool {
        match self.target_host.as_deref() {
            None | Some("") => true,
            Some(target) => target == host,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        encode_payload(self)
    }

    pub fn decode(payload: &str) -> Result<Self, ProtocolError> {
        decode_payload(payload)
    }
}

/// Join handshake status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Done,
}

/// Messages on the `Sync` channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    /// A newly joined host asks for a full snapshot
    Request { hostname: String },

    /// A responder finished streaming the snapshot to `hostname`
    Response { hostname: String, status: SyncStatus },
}

impl SyncMessage {
    pub fn request(hostname: impl Into<String>) -> Self {
        Self::Request {
            hostname: hostname.into(),
        }
    }

    pub fn done(hostname: impl Into<String>) -> Self {
        Self::Response {
            hostname: hostname.into(),
            status: SyncStatus::Done,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        encode_payload(self)
    }

    pub fn decode(payload: &str) -> Result<Self, ProtocolError> {
        decode_payload(payload)
    }
}

// === Serialization ===

/// Serialize a payload to JSON, enforcing `MAX_MESSAGE_SIZE`
pub fn encode_payload<T: Serialize>(msg: &T) -> Result<String, ProtocolError> {
    let json = serde_json::to_string(msg).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    if json.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: json.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(json)
}

/// Deserialize a JSON payload
pub fn decode_payload<T: DeserializeOwned>(payload: &str) -> Result<T, ProtocolError> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: payload.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(serde_json::from_str(payload)?)
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names() {
        for channel in Channel::FILE_CHANNELS {
            let parsed: Channel = channel.as_str().parse().unwrap();
            assert_eq!(parsed, channel);
        }
        assert_eq!("SYNC".parse::<Channel>().unwrap(), Channel::Sync);
        assert!("RENAME".parse::<Channel>().is_err());
    }

    #[test]
    fn test_op_channels() {
        assert_eq!(
            FileOp::CreateDir { mode: 0o755, uid: 0, gid: 0 }.channel(),
            Channel::Create
        );
        assert_eq!(
            FileOp::Symlink { target: "x".into() }.channel(),
            Channel::Write
        );
        assert_eq!(FileOp::Move { from: "a".into() }.channel(), Channel::Move);
        assert_eq!(FileOp::Remove.channel(), Channel::Remove);
        assert_eq!(FileOp::Chmod { mode: 0o600 }.channel(), Channel::Chmod);
    }

    #[test]
    fn test_write_file_content_is_base64() {
        let msg = WireMessage::new(
            "alpha",
            "docs/readme.txt",
            FileOp::WriteFile {
                mode: 0o644,
                uid: 1000,
                gid: 1000,
                content: b"hello".to_vec(),
            },
        );

        let json = msg.encode().unwrap();
        assert!(json.contains("\"type\":\"write_file\""));
        assert!(json.contains("aGVsbG8="));
        assert!(!json.contains("target_host"));

        let decoded = WireMessage::decode(&json).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_addressing() {
        let msg = WireMessage::new("A", "f", FileOp::Remove);
        assert!(msg.is_addressed_to("A"));
        assert!(msg.is_addressed_to("B"));
        assert!(msg.is_from("A"));
        assert!(!msg.is_from("B"));

        let targeted = msg.clone().with_target(Some("B"));
        assert!(!targeted.is_addressed_to("A"));
        assert!(targeted.is_addressed_to("B"));

        let empty = msg.with_target(Some(""));
        assert_eq!(empty.target_host, None);
        assert!(empty.is_addressed_to("anyone"));
    }

    #[test]
    fn test_empty_target_on_wire_is_broadcast() {
        let json = r#"{"origin_host":"A","target_host":"","path":"x","op":{"type":"remove"}}"#;
        let msg = WireMessage::decode(json).unwrap();
        assert!(msg.is_addressed_to("B"));
    }

    #[test]
    fn test_sync_message_format() {
        let json = SyncMessage::done("beta").encode().unwrap();
        assert!(json.contains("\"type\":\"response\""));
        assert!(json.contains("\"status\":\"done\""));

        match SyncMessage::decode(&json).unwrap() {
            SyncMessage::Response { hostname, status } => {
                assert_eq!(hostname, "beta");
                assert_eq!(status, SyncStatus::Done);
            }
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let msg = WireMessage::new(
            "A",
            "big",
            FileOp::WriteFile {
                mode: 0o644,
                uid: 0,
                gid: 0,
                content: vec![0u8; MAX_MESSAGE_SIZE],
            },
        );
        assert!(matches!(
            msg.encode(),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(WireMessage::decode("{\"origin_host\":1}").is_err());
        assert!(SyncMessage::decode("[]").is_err());
    }
}
