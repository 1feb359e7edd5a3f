//! mfs Bus Server
//!
//! Lightweight publish/subscribe relay that carries replication traffic
//! between mfs daemons. Clients connect via WebSocket and exchange JSON
//! frames.
//!
//! # Protocol
//!
//! 1. Client sends `hello` with the shared token, server answers `welcome`
//! 2. Client subscribes to the channels it wants (`CREATE`, `WRITE`, ..., `SYNC`)
//! 3. Every `publish` is delivered to all current subscribers of its channel,
//!    the publisher included
//! 4. Nothing is persisted; subscribers that are offline miss the message

pub mod messages;
pub mod server;
pub mod topic;

pub use messages::{BusFrame, ErrorCode};
pub use server::{BusServer, ServerOptions};
pub use topic::{Topic, TopicError};

/// Default WebSocket port
pub const DEFAULT_PORT: u16 = mfs_core::DEFAULT_BUS_PORT;

/// Empty channels are dropped after this much inactivity (5 minutes)
pub const CHANNEL_IDLE_TIMEOUT_SECS: u64 = 300;

/// Interval between idle channel sweeps
pub const CLEANUP_INTERVAL_SECS: u64 = 60;

/// Maximum subscribers per channel
pub const MAX_SUBSCRIBERS_PER_CHANNEL: usize = 1024;
