//! mfs Core - Shared types, wire protocol, and configuration
//!
//! This crate contains the foundational types used across all mfs components.
//! It has no dependencies on networking code and performs filesystem I/O only
//! when asked to snapshot metadata or load configuration.

pub mod config;
pub mod error;
pub mod path;
pub mod protocol;
pub mod types;

pub use config::{BusConfig, Config, ConfigError, NodeConfig, ServerConfig, SyncConfig, SyncRole};
pub use error::*;
pub use protocol::*;
pub use types::*;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum path length in bytes
pub const MAX_PATH_LEN: usize = 4096;

/// Maximum filename length in bytes
pub const MAX_FILENAME_LEN: usize = 255;

/// Maximum encoded message size (15 MB).
///
/// Fits in a single WebSocket frame at the transport's default limits.
pub const MAX_MESSAGE_SIZE: usize = 15 * 1024 * 1024;

/// Default flush interval in milliseconds
pub const DEFAULT_SYNC_INTERVAL_MS: u64 = 2000;

/// Default bus port
pub const DEFAULT_BUS_PORT: u16 = 4443;
